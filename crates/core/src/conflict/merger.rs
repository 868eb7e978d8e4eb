//! Line-based three-way textual merge.
//!
//! Uses the `diffy` crate to merge a base, "ours" (the shared repository),
//! and "theirs" (the workspace) version of a file. Conflicting regions are
//! written out in diff3 style so the base text is visible between markers.

use diffy::{ConflictStyle, MergeOptions};
use tracing::debug;

const MARKER_START: &str = "<<<<<<<";
const MARKER_END: &str = ">>>>>>>";

/// The result of a three-way merge attempt.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// The merged content (contains conflict markers if `has_conflicts`).
    pub merged_content: String,
    pub has_conflicts: bool,
    /// Locations of conflict marker blocks within the merged content.
    pub conflict_markers: Vec<ConflictMarker>,
}

impl MergeResult {
    fn clean(content: &str) -> Self {
        Self {
            merged_content: content.to_string(),
            has_conflicts: false,
            conflict_markers: Vec::new(),
        }
    }
}

/// A single conflict region within merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    /// First line (1-indexed) of the block, the `<<<<<<<` line.
    pub start_line: usize,
    /// Last line (1-indexed) of the block, the `>>>>>>>` line.
    pub end_line: usize,
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `ours` and `theirs` relative to `base`.
    ///
    /// Always returns content. On conflict the content carries
    /// `<<<<<<<` / `|||||||` / `=======` / `>>>>>>>` markers and
    /// `has_conflicts` is set.
    pub fn three_way_merge(base: &str, ours: &str, theirs: &str) -> MergeResult {
        if ours == base || ours == theirs {
            debug!("ours unchanged or identical to theirs, taking theirs");
            return MergeResult::clean(theirs);
        }
        if theirs == base {
            debug!("theirs unchanged, taking ours");
            return MergeResult::clean(ours);
        }

        let mut options = MergeOptions::new();
        options.set_conflict_style(ConflictStyle::Diff3);
        match options.merge(base, ours, theirs) {
            Ok(merged) => {
                debug!("clean three-way merge");
                MergeResult::clean(&merged)
            }
            Err(conflicted) => {
                let conflict_markers = find_conflict_markers(&conflicted);
                debug!(regions = conflict_markers.len(), "three-way merge has conflicts");
                MergeResult {
                    merged_content: conflicted,
                    has_conflicts: true,
                    conflict_markers,
                }
            }
        }
    }

    /// Quick check: can these three versions be merged without conflicts?
    pub fn can_auto_merge(base: &str, ours: &str, theirs: &str) -> bool {
        if ours == base || theirs == base || ours == theirs {
            return true;
        }
        diffy::merge(base, ours, theirs).is_ok()
    }
}

/// Whether `content` contains at least one complete conflict block.
pub fn has_conflict_markers(content: &str) -> bool {
    !find_conflict_markers(content).is_empty()
}

fn find_conflict_markers(content: &str) -> Vec<ConflictMarker> {
    let mut markers = Vec::new();
    let mut open: Option<usize> = None;
    for (idx, line) in content.lines().enumerate() {
        if line.starts_with(MARKER_START) {
            open = Some(idx + 1);
        } else if line.starts_with(MARKER_END) {
            if let Some(start_line) = open.take() {
                markers.push(ConflictMarker {
                    start_line,
                    end_line: idx + 1,
                });
            }
        }
    }
    markers
}
