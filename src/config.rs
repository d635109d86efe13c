use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ::config::{Config, Environment, File};
use serde::Deserialize;

use crate::history::MergeMode;

const DEFAULT_SOURCE_URL: &str = "https://www.pima.go.cr/boletin/";
// iPhone 14 Safari, the device the bulletin site renders best for.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) \
    AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Mobile/15E148 Safari/604.1";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub source: SourceCfg,
    pub fetch: FetchCfg,
    pub storage: StorageCfg,
    pub schedule: ScheduleCfg,
    pub server: ServerCfg,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourceCfg {
    pub url: String,
    pub user_agent: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub frame_depth: usize,
}

impl Default for SourceCfg {
    fn default() -> Self {
        Self {
            url: DEFAULT_SOURCE_URL.into(),
            user_agent: DEFAULT_USER_AGENT.into(),
            timeout: Duration::from_secs(30),
            frame_depth: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FetchCfg {
    pub pdf_dir: PathBuf,
    pub concurrency: usize,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for FetchCfg {
    fn default() -> Self {
        Self {
            pdf_dir: PathBuf::from("pdfs"),
            concurrency: 4,
            max_retries: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageCfg {
    pub cache_file: PathBuf,
    pub history_file: PathBuf,
    pub db_path: PathBuf,
    pub mode: MergeMode,
    pub sync_command: Option<String>,
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            cache_file: PathBuf::from("datos_cache.json"),
            history_file: PathBuf::from("historial.json"),
            db_path: PathBuf::from("data/pima.sqlite"),
            mode: MergeMode::Snapshot,
            sync_command: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleCfg {
    #[serde(with = "humantime_serde")]
    pub every: Duration,
}

impl Default for ScheduleCfg {
    fn default() -> Self {
        Self {
            every: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerCfg {
    pub bind: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".into(),
        }
    }
}

/// Layered load: defaults < ./pima.toml < `extra` < PIMA_* env (`__` nests).
pub fn load(extra: Option<&Path>) -> Result<Settings> {
    let mut builder = Config::builder().add_source(File::with_name("pima").required(false));
    if let Some(path) = extra {
        builder = builder.add_source(File::from(path.to_path_buf()));
    }
    let mut settings: Settings = builder
        .add_source(
            Environment::with_prefix("PIMA")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .context("loading settings")?
        .try_deserialize()
        .context("invalid settings")?;

    if let Ok(port) = std::env::var("PORT") {
        settings.server.bind = with_port(&settings.server.bind, &port);
    }
    if settings.fetch.concurrency == 0 {
        settings.fetch.concurrency = 1;
    }
    Ok(settings)
}

fn with_port(bind: &str, port: &str) -> String {
    let host = bind.rsplit_once(':').map(|(h, _)| h).unwrap_or(bind);
    format!("{}:{}", host, port.trim())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "[storage]\nmode = \"cumulative\"\n\n[schedule]\nevery = \"5m\"\n",
        )
        .unwrap();

        let s = load(Some(&path)).unwrap();
        assert_eq!(s.storage.mode, MergeMode::Cumulative);
        assert_eq!(s.schedule.every, Duration::from_secs(300));
        assert_eq!(s.fetch.concurrency, 4);
        assert_eq!(s.source.url, DEFAULT_SOURCE_URL);
    }

    #[test]
    fn port_replaces_bind_port() {
        assert_eq!(with_port("0.0.0.0:5000", "8080"), "0.0.0.0:8080");
        assert_eq!(with_port("localhost", "9000"), "localhost:9000");
    }
}
