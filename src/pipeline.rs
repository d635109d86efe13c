use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Settings;
use crate::db;
use crate::fetcher::{self, FetchJob, Fetcher};
use crate::history::{self, History, MergeMode};
use crate::locator;
use crate::model::{DocumentLink, PriceRecord};
use crate::page::Page;
use crate::parser::{self, PageText};
use crate::store;
use crate::sync::HistorySync;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("a pipeline run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub enum Trigger {
    Scheduled,
    Manual,
    Cli,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
            Trigger::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    /// Documents downloaded or found in the cache.
    pub documents: usize,
    /// Unique records written to the snapshot cache.
    pub record_count: usize,
    /// Records added to the cumulative history (equals `record_count` in
    /// snapshot mode).
    pub appended: usize,
}

/// Sequences locate → fetch → extract → sort → reconcile → persist.
/// At most one run executes at a time.
pub struct Pipeline {
    settings: Settings,
    client: Client,
    fetcher: Fetcher,
    text: Arc<dyn PageText>,
    sync: Box<dyn HistorySync>,
    progress: bool,
    running: Mutex<()>,
}

impl Pipeline {
    pub fn new(settings: Settings, text: Arc<dyn PageText>, sync: Box<dyn HistorySync>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&settings.source.user_agent)
            .timeout(settings.source.timeout)
            .cookie_store(true)
            .build()
            .context("building HTTP client")?;
        let fetcher = Fetcher::new(client.clone(), &settings.fetch);
        Ok(Self {
            settings,
            client,
            fetcher,
            text,
            sync,
            progress: false,
            running: Mutex::new(()),
        })
    }

    /// Draw progress bars on stderr (interactive use).
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// One full execution. A concurrent call fails fast with
    /// `RunError::AlreadyRunning` instead of waiting.
    pub async fn run(&self, trigger: Trigger) -> Result<RunOutcome, RunError> {
        let _running = self.running.try_lock().map_err(|_| RunError::AlreadyRunning)?;
        let t0 = Instant::now();

        let run_id = match db::connect(&self.settings.storage.db_path)
            .and_then(|conn| db::start_run(&conn, trigger.as_str()))
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("run will not be logged: {:#}", e);
                None
            }
        };

        let result = self.execute().await;

        if let Some(run_id) = run_id {
            let logged = db::connect(&self.settings.storage.db_path).and_then(|conn| {
                let status = result.as_ref().map_err(|e| format!("{:#}", e));
                db::finish_run(&conn, run_id, status)
            });
            if let Err(e) = logged {
                warn!("could not record run {}: {:#}", run_id, e);
            }
        }

        let outcome = result?;
        info!(
            trigger = trigger.as_str(),
            documents = outcome.documents,
            records = outcome.record_count,
            appended = outcome.appended,
            "run finished in {:.1}s",
            t0.elapsed().as_secs_f64()
        );
        Ok(outcome)
    }

    /// Navigate and return the deduplicated attachment links.
    pub async fn locate(&self) -> Result<Vec<DocumentLink>> {
        let source = &self.settings.source;
        let page = Page::load(&self.client, &source.url, source.frame_depth).await?;
        let links = locator::locate(&page);
        info!(links = links.len(), "located bulletin documents");
        Ok(links)
    }

    async fn execute(&self) -> Result<RunOutcome> {
        let links = self.locate().await?;

        // Phase 1: fetch
        let jobs = self.plan_jobs(&links);
        let pb = self.bar(jobs.len(), "download");
        let assets = self.fetcher.fetch_all(jobs, &pb).await;
        pb.finish_and_clear();
        if let Err(e) = db::connect(&self.settings.storage.db_path)
            .and_then(|conn| db::record_documents(&conn, &assets))
        {
            warn!("document cache not updated: {:#}", e);
        }
        info!(documents = assets.len(), skipped = links.len() - assets.len(), "documents ready");

        // Phase 2: extract
        let fallback = Local::now().format("%d/%m/%Y").to_string();
        let text = Arc::clone(&self.text);
        let pb = self.bar(assets.len(), "extract");
        let documents = assets.len();
        let pb_worker = pb.clone();
        let mut records = tokio::task::spawn_blocking(move || {
            parser::extract_all(text.as_ref(), &assets, &fallback, &pb_worker)
        })
        .await
        .context("extraction task")?;
        pb.finish_and_clear();

        // Phase 3: order + reconcile + persist
        history::sort_newest_first(&mut records);
        let (record_count, appended) = self.persist(&records)?;

        Ok(RunOutcome {
            documents,
            record_count,
            appended,
        })
    }

    /// Sequence numbers follow link order. A URL fetched by an earlier run
    /// reuses its file (while it is still on disk), so the cache is
    /// effectively keyed by URL. Without the database every file gets a
    /// fresh name.
    fn plan_jobs(&self, links: &[DocumentLink]) -> Vec<FetchJob> {
        let conn = db::connect(&self.settings.storage.db_path)
            .map_err(|e| warn!("document cache unavailable: {:#}", e))
            .ok();
        let stamp = Local::now().format("%Y%m%d%H%M").to_string();
        let pdf_dir = &self.settings.fetch.pdf_dir;
        links
            .iter()
            .enumerate()
            .map(|(i, link)| {
                let seq = i + 1;
                let cached = conn.as_ref().and_then(|conn| {
                    db::cached_file(conn, &link.url)
                        .map_err(|e| warn!(url = %link.url, "cache lookup failed: {:#}", e))
                        .ok()
                        .flatten()
                });
                let file_name = match cached {
                    Some(name) if pdf_dir.join(&name).exists() => name,
                    _ => fetcher::target_name(seq, &link.label, &stamp),
                };
                FetchJob {
                    seq,
                    url: link.url.clone(),
                    label: link.label.clone(),
                    file_name,
                }
            })
            .collect()
    }

    fn persist(&self, records: &[PriceRecord]) -> Result<(usize, usize)> {
        let storage = &self.settings.storage;
        let snapshot = history::reconcile(records, &History::default(), MergeMode::Snapshot).merged;
        store::save(&storage.cache_file, &snapshot)
            .with_context(|| format!("saving cache {}", storage.cache_file.display()))?;

        let appended = match storage.mode {
            MergeMode::Snapshot => snapshot.len(),
            MergeMode::Cumulative => match self.append_history(records) {
                Ok(n) => n,
                Err(e) => {
                    warn!("history not updated: {:#}", e);
                    0
                }
            },
        };
        Ok((snapshot.len(), appended))
    }

    fn append_history(&self, records: &[PriceRecord]) -> Result<usize> {
        let path = &self.settings.storage.history_file;
        let existing = History::new(store::load(path)?.unwrap_or_default());
        let r = history::reconcile(records, &existing, MergeMode::Cumulative);
        if r.appended.is_empty() {
            info!(history = existing.len(), "no new records for history");
            return Ok(0);
        }
        store::save(path, &r.merged)?;
        info!(appended = r.appended.len(), history = r.merged.len(), "history updated");
        self.sync.publish(path);
        Ok(r.appended.len())
    }

    fn bar(&self, len: usize, phase: &str) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(phase.to_string());
        pb
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::NoSync;
    use anyhow::anyhow;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::path::Path;
    use std::time::Duration;

    /// Treats everything after the 8-byte `%PDF-1.x` header as text, pages
    /// split on form feeds.
    struct PlainText;

    impl PageText for PlainText {
        fn page_texts(&self, bytes: &[u8]) -> Result<Vec<String>> {
            let body = bytes.get(8..).ok_or_else(|| anyhow!("too short"))?;
            Ok(std::str::from_utf8(body)?
                .split('\u{c}')
                .map(str::to_string)
                .collect())
        }
    }

    const NEW_DOC: &str = "%PDF-1.4Fecha de plaza: 05/06/2024\n\
        Producto Mayorista Minimo Maximo Moda Promedio\n\
        Tomate Caja 9,000 11,000 10,000 10,050\n\
        Chile dulce Caja 7,000 9,000 8,000 8,100\n\
        Yuca Saco 5,000 6,000 5,500 5,600";
    const OLD_DOC: &str = "%PDF-1.4Fecha de plaza: 04/06/2024\n\
        Papa blanca Saco 10,000 12,500 11,000 11,250.5\n\
        Cebolla Saco 14,000 16,500 15,000 15,250";

    async fn bulletin_site() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(
                "/boletin/",
                get(|| async {
                    axum::response::Html(
                        r#"<a href="/docs/nuevo.pdf">Documentos adjuntos 05/06</a>
                           <iframe src="/boletin/anexos"></iframe>"#,
                    )
                }),
            )
            .route(
                "/boletin/anexos",
                get(|| async {
                    axum::response::Html(
                        r#"<a href="/docs/anterior.pdf">Documentos adjuntos 04/06</a>
                           <a href="/docs/roto.pdf">Documentos adjuntos roto</a>
                           <a href="/docs/nuevo.pdf">Documentos adjuntos 05/06</a>"#,
                    )
                }),
            )
            .route("/docs/nuevo.pdf", get(|| async { NEW_DOC.as_bytes().to_vec() }))
            .route("/docs/anterior.pdf", get(|| async { OLD_DOC.as_bytes().to_vec() }))
            .route("/docs/roto.pdf", get(|| async { StatusCode::NOT_FOUND }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn settings(dir: &Path, base: &str, mode: MergeMode) -> Settings {
        let mut s = Settings::default();
        s.source.url = format!("{}/boletin/", base);
        s.source.timeout = Duration::from_secs(5);
        s.fetch.pdf_dir = dir.join("pdfs");
        s.fetch.backoff = Duration::from_millis(5);
        s.storage.cache_file = dir.join("datos_cache.json");
        s.storage.history_file = dir.join("historial.json");
        s.storage.db_path = dir.join("pima.sqlite");
        s.storage.mode = mode;
        s
    }

    fn pipeline(settings: Settings) -> Pipeline {
        Pipeline::new(settings, Arc::new(PlainText), Box::new(NoSync)).unwrap()
    }

    fn rec(producto: &str, promedio: f64, fecha: &str) -> PriceRecord {
        PriceRecord {
            producto: producto.into(),
            unidad: "Saco".into(),
            mayorista: "Saco".into(),
            minimo: 10000.0,
            maximo: 12500.0,
            moda: 11000.0,
            promedio,
            fecha: fecha.into(),
        }
    }

    #[tokio::test]
    async fn end_to_end_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let base = bulletin_site().await;
        let p = pipeline(settings(dir.path(), &base, MergeMode::Snapshot));

        let outcome = p.run(Trigger::Cli).await.unwrap();
        assert_eq!(outcome.documents, 2);
        assert_eq!(outcome.record_count, 5);

        let cache = store::load(&dir.path().join("datos_cache.json")).unwrap().unwrap();
        let fechas: Vec<&str> = cache.iter().map(|r| r.fecha.as_str()).collect();
        assert_eq!(fechas, ["05/06/2024", "05/06/2024", "05/06/2024", "04/06/2024", "04/06/2024"]);
        assert_eq!(cache[0].producto, "Tomate");
        assert!(!dir.path().join("historial.json").exists());

        let pdfs = std::fs::read_dir(dir.path().join("pdfs")).unwrap().count();
        assert_eq!(pdfs, 2);
    }

    #[tokio::test]
    async fn end_to_end_cumulative_appends_only_new() {
        let dir = tempfile::tempdir().unwrap();
        let base = bulletin_site().await;
        let existing = vec![
            rec("Papa blanca", 11250.5, "04/06/2024"),
            rec("Ayote", 700.0, "01/06/2024"),
        ];
        let mut cebolla = rec("Cebolla", 15250.0, "04/06/2024");
        cebolla.minimo = 14000.0;
        cebolla.maximo = 16500.0;
        cebolla.moda = 15000.0;
        let existing: Vec<_> = existing.into_iter().chain([cebolla]).collect();
        store::save(&dir.path().join("historial.json"), &existing).unwrap();

        let p = pipeline(settings(dir.path(), &base, MergeMode::Cumulative));
        let outcome = p.run(Trigger::Manual).await.unwrap();
        assert_eq!(outcome.record_count, 5);
        assert_eq!(outcome.appended, 3);

        let history = store::load(&dir.path().join("historial.json")).unwrap().unwrap();
        assert_eq!(history.len(), existing.len() + 3);
        assert_eq!(&history[..existing.len()], existing.as_slice());

        // Nothing new the second time; documents come from the cache.
        let again = p.run(Trigger::Manual).await.unwrap();
        assert_eq!(again.appended, 0);
        let pdfs = std::fs::read_dir(dir.path().join("pdfs")).unwrap().count();
        assert_eq!(pdfs, 2);
    }

    #[tokio::test]
    async fn overlapping_runs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = bulletin_site().await;
        let p = pipeline(settings(dir.path(), &base, MergeMode::Snapshot));

        let _held = p.running.lock().await;
        let err = p.run(Trigger::Scheduled).await.unwrap_err();
        assert!(matches!(err, RunError::AlreadyRunning));
    }

    #[tokio::test]
    async fn unusable_database_does_not_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let base = bulletin_site().await;
        let mut s = settings(dir.path(), &base, MergeMode::Snapshot);
        // A directory cannot be opened as a database.
        s.storage.db_path = dir.path().to_path_buf();
        let p = pipeline(s);

        let outcome = p.run(Trigger::Cli).await.unwrap();
        assert_eq!(outcome.documents, 2);
        assert_eq!(outcome.record_count, 5);
        assert!(dir.path().join("datos_cache.json").exists());
    }

    #[tokio::test]
    async fn navigation_failure_fails_the_run_and_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(settings(dir.path(), "http://127.0.0.1:1", MergeMode::Snapshot));

        let err = p.run(Trigger::Scheduled).await.unwrap_err();
        assert!(matches!(err, RunError::Failed(_)));
        assert!(!dir.path().join("datos_cache.json").exists());

        let conn = db::connect(&dir.path().join("pima.sqlite")).unwrap();
        let runs = db::recent_runs(&conn, 1).unwrap();
        assert!(runs[0].error.as_deref().unwrap_or("").contains("navigating"));
    }
}
