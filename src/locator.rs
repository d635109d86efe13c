use indexmap::IndexSet;

use crate::model::DocumentLink;
use crate::page::Page;

/// Visible text every bulletin attachment link carries.
pub const MARKER: &str = "Documentos adjuntos";

/// Collect marker anchors from the page and all its frames, deduplicated by
/// `(label, url)`. First-seen order is kept so sequence numbers are stable.
pub fn locate(page: &Page) -> Vec<DocumentLink> {
    let links: IndexSet<DocumentLink> = page
        .documents()
        .flat_map(|doc| doc.anchors_matching(|text| text.contains(MARKER)))
        .map(|a| DocumentLink {
            label: a.text,
            url: a.href,
        })
        .collect();
    links.into_iter().collect()
}

// ── Tests ──
