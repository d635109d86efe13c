use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::model::FetchedAsset;
use crate::pipeline::RunOutcome;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS documents (
            id          INTEGER PRIMARY KEY,
            url         TEXT UNIQUE NOT NULL,
            label       TEXT NOT NULL,
            file_name   TEXT NOT NULL,
            bytes       INTEGER NOT NULL,
            fetched_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY,
            triggered_by TEXT NOT NULL,
            started_at  TEXT NOT NULL DEFAULT (datetime('now')),
            finished_at TEXT,
            documents   INTEGER,
            records     INTEGER,
            appended    INTEGER,
            error       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
        ",
    )?;
    Ok(())
}

// ── Documents ──

/// File a URL was stored under by an earlier run, if any.
pub fn cached_file(conn: &Connection, url: &str) -> Result<Option<String>> {
    let name = conn
        .query_row(
            "SELECT file_name FROM documents WHERE url = ?1",
            [url],
            |r| r.get(0),
        )
        .optional()?;
    Ok(name)
}

pub fn record_documents(conn: &Connection, assets: &[FetchedAsset]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO documents (url, label, file_name, bytes) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(url) DO UPDATE SET
                label = excluded.label,
                file_name = excluded.file_name,
                bytes = excluded.bytes",
        )?;
        for a in assets {
            let file_name = a
                .local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            stmt.execute(rusqlite::params![a.url, a.label, file_name, a.bytes.len() as i64])?;
        }
    }
    tx.commit()?;
    Ok(())
}

// ── Runs ──

pub fn start_run(conn: &Connection, trigger: &str) -> Result<i64> {
    conn.execute("INSERT INTO runs (triggered_by) VALUES (?1)", [trigger])?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_run(conn: &Connection, id: i64, result: Result<&RunOutcome, String>) -> Result<()> {
    match result {
        Ok(o) => conn.execute(
            "UPDATE runs SET finished_at = datetime('now'), documents = ?2, records = ?3, appended = ?4
             WHERE id = ?1",
            rusqlite::params![id, o.documents as i64, o.record_count as i64, o.appended as i64],
        )?,
        Err(e) => conn.execute(
            "UPDATE runs SET finished_at = datetime('now'), error = ?2 WHERE id = ?1",
            rusqlite::params![id, e],
        )?,
    };
    Ok(())
}

pub struct RunRow {
    pub id: i64,
    pub trigger: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub records: Option<i64>,
    pub appended: Option<i64>,
    pub error: Option<String>,
}

pub fn recent_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, triggered_by, started_at, finished_at, records, appended, error
         FROM runs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| {
            Ok(RunRow {
                id: row.get(0)?,
                trigger: row.get(1)?,
                started_at: row.get(2)?,
                finished_at: row.get(3)?,
                records: row.get(4)?,
                appended: row.get(5)?,
                error: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub documents: usize,
    pub runs: usize,
    pub failed: usize,
    pub last_success: Option<String>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let documents: usize = conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?;
    let runs: usize = conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))?;
    let failed: usize =
        conn.query_row("SELECT COUNT(*) FROM runs WHERE error IS NOT NULL", [], |r| r.get(0))?;
    let last_success: Option<String> = conn.query_row(
        "SELECT MAX(finished_at) FROM runs WHERE finished_at IS NOT NULL AND error IS NULL",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        documents,
        runs,
        failed,
        last_success,
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn asset(url: &str, file: &str) -> FetchedAsset {
        FetchedAsset {
            seq: 1,
            url: url.into(),
            label: "Documentos adjuntos".into(),
            local_path: PathBuf::from("pdfs").join(file),
            bytes: b"%PDF-1.4".to_vec(),
        }
    }

    #[test]
    fn documents_are_keyed_by_url() {
        let conn = memory();
        assert_eq!(cached_file(&conn, "https://x.test/a.pdf").unwrap(), None);

        record_documents(&conn, &[asset("https://x.test/a.pdf", "1_a.pdf")]).unwrap();
        record_documents(&conn, &[asset("https://x.test/a.pdf", "1_a.pdf")]).unwrap();
        assert_eq!(
            cached_file(&conn, "https://x.test/a.pdf").unwrap().as_deref(),
            Some("1_a.pdf")
        );
        assert_eq!(get_stats(&conn).unwrap().documents, 1);
    }

    #[test]
    fn run_log() {
        let conn = memory();
        let ok = start_run(&conn, "manual").unwrap();
        let outcome = RunOutcome {
            documents: 2,
            record_count: 5,
            appended: 3,
        };
        finish_run(&conn, ok, Ok(&outcome)).unwrap();
        let bad = start_run(&conn, "scheduled").unwrap();
        finish_run(&conn, bad, Err("navigating failed".into())).unwrap();

        let stats = get_stats(&conn).unwrap();
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.failed, 1);
        assert!(stats.last_success.is_some());

        let runs = recent_runs(&conn, 10).unwrap();
        assert_eq!(runs[0].id, bad);
        assert_eq!(runs[0].error.as_deref(), Some("navigating failed"));
        assert_eq!(runs[1].records, Some(5));
        assert_eq!(runs[1].appended, Some(3));
    }
}
