use anyhow::{anyhow, Result};
use tracing::debug;

use super::PageText;

/// Text layer extraction through `pdf-extract`, which lays glyphs out by
/// position: cells on one baseline come back as one space-separated line.
pub struct PdfText;

impl PageText for PdfText {
    fn page_texts(&self, bytes: &[u8]) -> Result<Vec<String>> {
        let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|e| anyhow!("unreadable PDF: {}", e))?;

        Ok(pages
            .into_iter()
            .enumerate()
            .filter_map(|(i, text)| {
                if text.trim().is_empty() {
                    debug!(page = i + 1, "page has no text layer");
                    None
                } else {
                    Some(text)
                }
            })
            .collect())
    }
}
