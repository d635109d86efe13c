use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use regex::Regex;
use reqwest::{Client, StatusCode};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::FetchCfg;
use crate::model::FetchedAsset;

const PDF_MAGIC: &[u8] = b"%PDF";
const LABEL_CHARS: usize = 20;

static UNSAFE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w.-]").unwrap());

/// One document to fetch in a batch.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub seq: usize,
    pub url: String,
    pub label: String,
    pub file_name: String,
}

#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    dir: PathBuf,
    concurrency: usize,
    max_retries: u32,
    backoff: Duration,
}

enum Attempt {
    Body(Vec<u8>),
    Retry(StatusCode),
    Refused(StatusCode),
}

impl Fetcher {
    pub fn new(client: Client, cfg: &FetchCfg) -> Self {
        Self {
            client,
            dir: cfg.pdf_dir.clone(),
            concurrency: cfg.concurrency.max(1),
            max_retries: cfg.max_retries,
            backoff: cfg.backoff,
        }
    }

    /// Local path of `target_name`, downloading `url` only when the file is
    /// not there yet. `None` when the server refuses or the body is not a
    /// PDF; nothing is written in that case.
    pub async fn fetch(&self, url: &str, target_name: &str) -> Option<PathBuf> {
        match self.try_fetch(url, target_name).await {
            Ok(path) => path,
            Err(e) => {
                warn!(url, "download failed: {:#}", e);
                None
            }
        }
    }

    async fn try_fetch(&self, url: &str, target_name: &str) -> Result<Option<PathBuf>> {
        let path = self.dir.join(target_name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(file = %path.display(), "cache hit");
            return Ok(Some(path));
        }

        let body = match self.get_with_retry(url).await? {
            Attempt::Body(body) => body,
            Attempt::Retry(status) | Attempt::Refused(status) => {
                warn!(url, %status, "document not available");
                return Ok(None);
            }
        };

        if !body.starts_with(PDF_MAGIC) {
            warn!(url, "response is not a valid PDF, ignoring");
            return Ok(None);
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        // Write then rename so readers never see a partial file.
        let partial = path.with_extension("pdf.part");
        tokio::fs::write(&partial, &body)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        tokio::fs::rename(&partial, &path).await?;

        info!(url, file = %path.display(), bytes = body.len(), "downloaded");
        Ok(Some(path))
    }

    async fn get_with_retry(&self, url: &str) -> Result<Attempt> {
        let mut attempt = 0;
        loop {
            let outcome = self.get_once(url).await?;
            let status = match outcome {
                Attempt::Retry(status) => status,
                other => return Ok(other),
            };
            if attempt >= self.max_retries {
                return Ok(Attempt::Retry(status));
            }

            let backoff = self.backoff_for(attempt);
            warn!(
                "{} on {} (attempt {}/{}), backing off {:.1}s",
                status,
                url,
                attempt + 1,
                self.max_retries,
                backoff.as_secs_f64()
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// `backoff * 2^attempt`, saturating instead of overflowing.
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }

    async fn get_once(&self, url: &str) -> Result<Attempt> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await?;
            return Ok(Attempt::Body(body.to_vec()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Ok(Attempt::Retry(status))
        } else {
            Ok(Attempt::Refused(status))
        }
    }

    /// Fetch a batch concurrently. Results come back in `seq` order no matter
    /// which download finished first; skipped documents are absent.
    pub async fn fetch_all(&self, jobs: Vec<FetchJob>, pb: &ProgressBar) -> Vec<FetchedAsset> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = tokio::sync::mpsc::channel::<FetchedAsset>(self.concurrency * 2);

        for job in jobs {
            let fetcher = self.clone();
            let sem = Arc::clone(&semaphore);
            let tx = tx.clone();

            tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return;
                };
                let Some(local_path) = fetcher.fetch(&job.url, &job.file_name).await else {
                    return;
                };
                match tokio::fs::read(&local_path).await {
                    Ok(bytes) => {
                        let _ = tx
                            .send(FetchedAsset {
                                seq: job.seq,
                                url: job.url,
                                label: job.label,
                                local_path,
                                bytes,
                            })
                            .await;
                    }
                    Err(e) => warn!(file = %local_path.display(), "cannot read cached document: {}", e),
                }
            });
        }

        // Drop our copy of tx so rx closes when all spawned tasks finish
        drop(tx);

        let mut assets = Vec::new();
        while let Some(asset) = rx.recv().await {
            pb.inc(1);
            assets.push(asset);
        }
        assets.sort_by_key(|a| a.seq);
        assets
    }
}

/// `{seq}_{label prefix}_{stamp}.pdf`, unique per document within a run.
pub fn target_name(seq: usize, label: &str, stamp: &str) -> String {
    let prefix: String = label.chars().take(LABEL_CHARS).collect();
    let prefix = UNSAFE_NAME_RE.replace_all(&prefix, "_");
    format!("{}_{}_{}.pdf", seq, prefix, stamp)
}

// ── Tests ──
