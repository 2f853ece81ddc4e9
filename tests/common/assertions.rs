//! Custom assertions over run summaries and archive directories

use dataset_archiver::{ChangeKind, RunOutcome, RunSummary};
use std::collections::BTreeSet;
use std::path::Path;

use super::year_file;

/// Assert the outcome, printing the fatal error on mismatch
pub fn assert_outcome(summary: &RunSummary, expected: RunOutcome) {
    assert_eq!(
        summary.outcome,
        Some(expected),
        "run {} ended in state {} with error {:?}",
        summary.run_id,
        summary.state,
        summary.error
    );
}

/// Every dispatched partition is a success or a failure, never both
pub fn assert_accounted(summary: &RunSummary, partitions: usize) {
    assert_eq!(
        summary.successes.len() + summary.failures.len(),
        partitions,
        "successes + failures must equal the number of distinct partitions"
    );
    assert_eq!(summary.partitions().len(), partitions);
}

/// Change kind recorded for a year partition
pub fn change_of(summary: &RunSummary, year: i64) -> Option<ChangeKind> {
    summary.changes.get(&year_file(year)).map(|e| e.kind)
}

/// Non-hidden file names in a directory
pub fn file_names(dir: &Path) -> BTreeSet<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| !name.starts_with('.'))
                .collect()
        })
        .unwrap_or_default()
}

/// Recursively copy a directory tree
pub fn copy_tree(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).expect("create copy target");
    for entry in std::fs::read_dir(from).expect("read copy source") {
        let entry = entry.expect("dir entry");
        let target = to.join(entry.file_name());
        if entry.file_type().expect("file type").is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).expect("copy file");
        }
    }
}
