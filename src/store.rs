use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};

use crate::model::PriceRecord;

/// Read a JSON array of records. `None` when the file has never been written.
pub fn load(path: &Path) -> Result<Option<Vec<PriceRecord>>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let records = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(records))
}

/// Replace the whole collection. Written to a sibling temp file and renamed,
/// so readers see either the old or the new array.
pub fn save(path: &Path, records: &[PriceRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(records)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
