//! Conflict detection, three-way merging, and record-level resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- predicting which paths a merge would conflict on.
//! 2. **Merging** -- line-based three-way merge of text files, and
//!    record-level three-way merge of line-record files.
//! 3. **Resolution** -- rebuilding conflicted record files in the index.

pub mod detector;
pub mod merger;
pub mod records;
pub mod resolver;

pub use detector::ConflictDetector;
pub use merger::{has_conflict_markers, ConflictMarker, MergeResult, Merger};
pub use records::{
    parse_records, render_records, Record, RecordConflictDetail, RecordMergeOutcome,
    RecordMerger, RecordSide,
};
pub use resolver::{ConflictResolver, ResolutionSummary};
