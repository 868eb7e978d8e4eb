//! Three-way merge of line-record files.
//!
//! A record file holds one JSON object per line, each keyed by a stable
//! identifier. Records are merged whole: a record is unchanged, modified,
//! or deleted relative to the base, and fields of unrelated records are
//! never combined.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{RecordConfig, TieBreak};
use crate::errors::MergeError;

/// One line of a record file.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: String,
    pub value: Value,
    /// The line as it appeared on disk, written back verbatim.
    pub raw: String,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.value == other.value
    }
}

/// Parse a record file. Blank lines are ignored; when an identifier occurs
/// twice the later line wins but keeps the earlier position.
pub fn parse_records(content: &str, id_field: &str) -> Result<Vec<Record>, MergeError> {
    let mut records: Vec<Record> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(trimmed).map_err(|e| MergeError::InvalidRecord {
            line: idx + 1,
            detail: e.to_string(),
        })?;
        let id = match value.get(id_field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(MergeError::MissingIdentifier {
                    line: idx + 1,
                    field: id_field.to_string(),
                })
            }
        };
        let record = Record {
            id: id.clone(),
            value,
            raw: trimmed.to_string(),
        };
        match positions.get(&id) {
            Some(&pos) => records[pos] = record,
            None => {
                positions.insert(id, records.len());
                records.push(record);
            }
        }
    }
    Ok(records)
}

/// Serialize records back to file content, one per line.
pub fn render_records(records: &[Record]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.raw);
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSide {
    Ours,
    Theirs,
}

/// A record modified on both sides that no timestamp could settle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConflictDetail {
    pub id: String,
    pub ours: Value,
    pub theirs: Value,
    /// The side whose version was written to the merged output.
    pub kept: RecordSide,
}

#[derive(Debug, Clone, Default)]
pub struct RecordMergeOutcome {
    pub records: Vec<Record>,
    /// Identifiers modified on both sides and settled by the tie-break rule.
    pub tie_broken: Vec<String>,
    /// Tie-broken identifiers that still need a human to look at them.
    pub conflicts: Vec<RecordConflictDetail>,
}

/// Record-level three-way merger.
#[derive(Debug, Clone)]
pub struct RecordMerger {
    id_field: String,
    timestamp_field: String,
    tie_break: TieBreak,
}

impl RecordMerger {
    pub fn new(config: &RecordConfig, tie_break: TieBreak) -> Self {
        Self {
            id_field: config.id_field.clone(),
            timestamp_field: config.timestamp_field.clone(),
            tie_break,
        }
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// Merge three record collections.
    ///
    /// Output order is "ours" order followed by records only "theirs" has.
    pub fn merge(&self, base: &[Record], ours: &[Record], theirs: &[Record]) -> RecordMergeOutcome {
        let base_map: HashMap<&str, &Record> = base.iter().map(|r| (r.id.as_str(), r)).collect();
        let ours_map: HashMap<&str, &Record> = ours.iter().map(|r| (r.id.as_str(), r)).collect();
        let theirs_map: HashMap<&str, &Record> =
            theirs.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut order: Vec<&str> = ours.iter().map(|r| r.id.as_str()).collect();
        let seen: HashSet<&str> = order.iter().copied().collect();
        order.extend(
            theirs
                .iter()
                .map(|r| r.id.as_str())
                .filter(|id| !seen.contains(id)),
        );

        let mut outcome = RecordMergeOutcome::default();
        for id in order {
            let b = base_map.get(id).copied();
            let o = ours_map.get(id).copied();
            let t = theirs_map.get(id).copied();

            let merged = match (b, o, t) {
                (None, Some(o), None) => Some(o),
                (None, None, Some(t)) => Some(t),
                (Some(b), Some(o), None) => {
                    // Deleted by theirs; a modification on our side outlives it.
                    if o == b {
                        debug!(id, "record deleted by theirs");
                        None
                    } else {
                        info!(id, "record deleted by theirs but modified by ours, keeping ours");
                        Some(o)
                    }
                }
                (Some(b), None, Some(t)) => {
                    if t == b {
                        debug!(id, "record deleted by ours");
                        None
                    } else {
                        info!(id, "record deleted by ours but modified by theirs, keeping theirs");
                        Some(t)
                    }
                }
                (b, Some(o), Some(t)) => {
                    if o == t {
                        Some(o)
                    } else if b.map(|b| b == o).unwrap_or(false) {
                        Some(t)
                    } else if b.map(|b| b == t).unwrap_or(false) {
                        Some(o)
                    } else {
                        Some(self.tie_break(id, o, t, &mut outcome))
                    }
                }
                (_, None, None) => None,
            };
            if let Some(record) = merged {
                outcome.records.push(record.clone());
            }
        }

        if !outcome.tie_broken.is_empty() {
            info!(
                rule = %self.tie_break,
                ids = ?outcome.tie_broken,
                unresolved = outcome.conflicts.len(),
                "records modified on both sides"
            );
        }
        outcome
    }

    /// Parse, merge and render in one go. A missing base is an empty file.
    pub fn merge_contents(
        &self,
        base: Option<&str>,
        ours: &str,
        theirs: &str,
    ) -> Result<(String, RecordMergeOutcome), MergeError> {
        let base = parse_records(base.unwrap_or(""), &self.id_field)?;
        let ours = parse_records(ours, &self.id_field)?;
        let theirs = parse_records(theirs, &self.id_field)?;
        let outcome = self.merge(&base, &ours, &theirs);
        Ok((render_records(&outcome.records), outcome))
    }

    fn tie_break<'r>(
        &self,
        id: &str,
        ours: &'r Record,
        theirs: &'r Record,
        outcome: &mut RecordMergeOutcome,
    ) -> &'r Record {
        outcome.tie_broken.push(id.to_string());
        match self.tie_break {
            TieBreak::Ours => ours,
            TieBreak::Theirs => theirs,
            TieBreak::LatestTimestamp => match self.compare_timestamps(ours, theirs) {
                Some(Ordering::Greater) => ours,
                Some(Ordering::Less) => theirs,
                _ => {
                    warn!(id, "record modified on both sides without distinguishing timestamps, keeping theirs");
                    outcome.conflicts.push(RecordConflictDetail {
                        id: id.to_string(),
                        ours: ours.value.clone(),
                        theirs: theirs.value.clone(),
                        kept: RecordSide::Theirs,
                    });
                    theirs
                }
            },
        }
    }

    fn compare_timestamps(&self, ours: &Record, theirs: &Record) -> Option<Ordering> {
        let a = ours.value.get(&self.timestamp_field)?;
        let b = theirs.value.get(&self.timestamp_field)?;
        match (a, b) {
            (Value::String(a), Value::String(b)) => {
                match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
                    (Ok(a), Ok(b)) => Some(a.cmp(&b)),
                    _ => None,
                }
            }
            (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
            _ => None,
        }
    }
}
