pub mod lines;
pub mod pdf;

use std::panic::{self, AssertUnwindSafe};

use anyhow::{anyhow, Result};
use indicatif::ProgressBar;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::model::{FetchedAsset, PriceRecord};
use lines::LineParser;

/// Per-page plain text of a document. Pages with no text are left out.
pub trait PageText: Send + Sync {
    fn page_texts(&self, bytes: &[u8]) -> Result<Vec<String>>;
}

/// Two-pass pipeline: bytes → page texts → records, in page/line order.
pub fn extract(source: &dyn PageText, bytes: &[u8], fallback_fecha: &str) -> Result<Vec<PriceRecord>> {
    let pages = source.page_texts(bytes)?;
    Ok(records_from_pages(&pages, fallback_fecha))
}

/// The in-force date spans pages; it resets only between documents.
pub fn records_from_pages<S: AsRef<str>>(pages: &[S], fallback_fecha: &str) -> Vec<PriceRecord> {
    let mut parser = LineParser::new(fallback_fecha);
    pages
        .iter()
        .flat_map(|page| page.as_ref().lines())
        .filter_map(|line| parser.feed(line))
        .collect()
}

/// Extract every asset in parallel; a document that fails is logged and
/// contributes nothing. Output keeps asset order.
pub fn extract_all(
    source: &dyn PageText,
    assets: &[FetchedAsset],
    fallback_fecha: &str,
    pb: &ProgressBar,
) -> Vec<PriceRecord> {
    let per_doc: Vec<Vec<PriceRecord>> = assets
        .par_iter()
        .map(|asset| {
            // lopdf can panic on malformed streams; keep that inside one document.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                extract(source, &asset.bytes, fallback_fecha)
            }))
            .unwrap_or_else(|_| Err(anyhow!("parser panicked")));
            pb.inc(1);

            match outcome {
                Ok(records) => {
                    info!(file = %asset.local_path.display(), records = records.len(), "extracted");
                    records
                }
                Err(e) => {
                    warn!(file = %asset.local_path.display(), "could not process document: {:#}", e);
                    Vec::new()
                }
            }
        })
        .collect();

    per_doc.into_iter().flatten().collect()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Pages separated by form feeds after an 8-byte `%PDF-1.x` header.
    struct FormFeedText;

    impl PageText for FormFeedText {
        fn page_texts(&self, bytes: &[u8]) -> Result<Vec<String>> {
            let body = bytes
                .strip_prefix(b"%PDF-1.4")
                .ok_or_else(|| anyhow!("bad header"))?;
            let text = std::str::from_utf8(body)?;
            Ok(text
                .split('\u{c}')
                .filter(|p| !p.trim().is_empty())
                .map(str::to_string)
                .collect())
        }
    }

    fn asset(seq: usize, bytes: &[u8]) -> FetchedAsset {
        FetchedAsset {
            seq,
            url: format!("https://example.test/{}.pdf", seq),
            label: format!("doc {}", seq),
            local_path: PathBuf::from(format!("{}.pdf", seq)),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn bulletin_fixture() {
        let text = std::fs::read_to_string("tests/fixtures/boletin.txt").unwrap();
        let pages: Vec<&str> = text.split('\u{c}').collect();
        let records = records_from_pages(&pages, "19/10/2026");

        let names: Vec<&str> = records.iter().map(|r| r.producto.as_str()).collect();
        assert_eq!(
            names,
            ["Aguacate Hass", "Ayote sazón", "Cebolla amarilla", "Chile dulce", "Papa blanca", "Tomate"]
        );
        assert!(records.iter().all(|r| r.fecha == "05/06/2024"));

        let papa = &records[4];
        assert_eq!(papa.mayorista, "Saco");
        assert_eq!(papa.maximo, 12500.0);
        assert_eq!(papa.promedio, 11250.5);
    }

    #[test]
    fn date_carries_across_pages() {
        let pages = ["Fecha de plaza: 03/06/2024\nYuca Kg 1 2 3 4", "Elote Unidad 5 6 7 8"];
        let records = records_from_pages(&pages, "19/10/2026");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].fecha, "03/06/2024");
    }

    #[test]
    fn a_broken_document_does_not_stop_the_batch() {
        let assets = vec![
            asset(1, b"%PDF-1.4Fecha de plaza: 01/06/2024\nYuca Kg 1 2 3 4"),
            asset(2, b"garbage"),
            asset(3, b"%PDF-1.4Elote Unidad 5 6 7 8\x0cPapa Saco 9 10 11 12"),
        ];
        let records = extract_all(&FormFeedText, &assets, "19/10/2026", &ProgressBar::hidden());

        let names: Vec<&str> = records.iter().map(|r| r.producto.as_str()).collect();
        assert_eq!(names, ["Yuca", "Elote", "Papa"]);
        // Dates do not leak between documents.
        assert_eq!(records[1].fecha, "19/10/2026");
    }
}
