use std::collections::{HashSet, VecDeque};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, info};
use url::Url;

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());
static FRAME: LazyLock<Selector> = LazyLock::new(|| Selector::parse("iframe[src], frame[src]").unwrap());
static BASE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("base[href]").unwrap());

/// An anchor as a reader sees it: visible text plus absolute target.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub text: String,
    pub href: String,
}

/// One HTML document, the page itself or an embedded frame.
#[derive(Debug, Clone)]
pub struct Document {
    pub url: Url,
    html: String,
}

impl Document {
    pub fn from_html(url: Url, html: impl Into<String>) -> Self {
        Self {
            url,
            html: html.into(),
        }
    }

    /// All anchors whose visible text satisfies `keep`.
    pub fn anchors_matching(&self, keep: impl Fn(&str) -> bool) -> Vec<Anchor> {
        let html = Html::parse_document(&self.html);
        let base = base_url(&html, &self.url);

        html.select(&ANCHOR)
            .filter_map(|el| {
                let text = visible_text(el.text());
                if !keep(&text) {
                    return None;
                }
                let href = base.join(el.value().attr("href")?.trim()).ok()?;
                Some(Anchor {
                    text,
                    href: href.to_string(),
                })
            })
            .collect()
    }

    fn frame_urls(&self) -> Vec<Url> {
        let html = Html::parse_document(&self.html);
        let base = base_url(&html, &self.url);
        html.select(&FRAME)
            .filter_map(|el| base.join(el.value().attr("src")?.trim()).ok())
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .collect()
    }
}

/// A loaded page: the root document and every reachable nested frame.
#[derive(Debug, Clone)]
pub struct Page {
    pub root: Document,
    pub frames: Vec<Document>,
}

impl Page {
    /// Navigate to `url`, then load frames breadth-first up to `frame_depth`
    /// levels. Navigation failure is an error; a frame that cannot be loaded
    /// is skipped.
    ///
    /// The markup is complete once the body is read, so there is no
    /// scroll-until-stable step.
    pub async fn load(client: &Client, url: &str, frame_depth: usize) -> Result<Page> {
        let root = get_document(client, url)
            .await
            .with_context(|| format!("navigating to {}", url))?;
        info!(url = %root.url, "page loaded");

        let mut seen: HashSet<Url> = HashSet::from([root.url.clone()]);
        let mut queue: VecDeque<(Url, usize)> =
            root.frame_urls().into_iter().map(|u| (u, 1)).collect();
        let mut frames = Vec::new();

        while let Some((frame_url, depth)) = queue.pop_front() {
            if depth > frame_depth || !seen.insert(frame_url.clone()) {
                continue;
            }
            match get_document(client, frame_url.as_str()).await {
                Ok(doc) => {
                    queue.extend(doc.frame_urls().into_iter().map(|u| (u, depth + 1)));
                    frames.push(doc);
                }
                Err(e) => debug!(url = %frame_url, "skipping frame: {:#}", e),
            }
        }

        debug!(frames = frames.len(), "frames loaded");
        Ok(Page { root, frames })
    }

    /// Root first, then frames in discovery order.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        std::iter::once(&self.root).chain(self.frames.iter())
    }
}

async fn get_document(client: &Client, url: &str) -> Result<Document> {
    let response = client.get(url).send().await?.error_for_status()?;
    let final_url = response.url().clone();
    let html = response.text().await?;
    Ok(Document::from_html(final_url, html))
}

fn base_url(html: &Html, fallback: &Url) -> Url {
    html.select(&BASE)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| fallback.join(href.trim()).ok())
        .unwrap_or_else(|| fallback.clone())
}

fn visible_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    let raw: String = parts.collect();
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Tests ──
