use std::collections::HashSet;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::model::{PriceRecord, RecordKey};

/// Which persisted view `reconcile` builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// The current run's unique records, newest date first.
    Snapshot,
    /// Existing history followed by every net-new record, append-only.
    Cumulative,
}

/// Records persisted across runs. Loaded at the start of a run and handed to
/// `reconcile` explicitly; never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct History {
    records: Vec<PriceRecord>,
}

impl History {
    pub fn new(records: Vec<PriceRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[PriceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    fn keys(&self) -> HashSet<RecordKey> {
        self.records.iter().map(PriceRecord::key).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Net-new records in extraction order.
    pub appended: Vec<PriceRecord>,
    /// The view selected by the merge mode.
    pub merged: Vec<PriceRecord>,
}

/// Drop every incoming record whose key is already in `existing` (or earlier
/// in the same batch), then build the requested view.
pub fn reconcile(
    incoming: &[PriceRecord],
    existing: &History,
    mode: MergeMode,
) -> Reconciliation {
    let mut seen = existing.keys();
    let appended: Vec<PriceRecord> = incoming
        .iter()
        .filter(|r| seen.insert(r.key()))
        .cloned()
        .collect();

    let merged = match mode {
        MergeMode::Cumulative => existing
            .records()
            .iter()
            .chain(appended.iter())
            .cloned()
            .collect(),
        MergeMode::Snapshot => snapshot(incoming),
    };

    Reconciliation { appended, merged }
}

/// Unique records of one run, newest `fecha` first.
pub fn snapshot(records: &[PriceRecord]) -> Vec<PriceRecord> {
    let mut seen = HashSet::new();
    let mut unique: Vec<PriceRecord> = records
        .iter()
        .filter(|r| seen.insert(r.key()))
        .cloned()
        .collect();
    sort_newest_first(&mut unique);
    unique
}

/// Stable sort by date descending; unparsable dates go last.
pub fn sort_newest_first(records: &mut [PriceRecord]) {
    records.sort_by_key(|r| std::cmp::Reverse(parse_fecha(&r.fecha)));
}

/// `dd/mm/yyyy`, anything else is `None`.
pub fn parse_fecha(fecha: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(fecha.trim(), "%d/%m/%Y").ok()
}

// ── Tests ──
