//! Batch Splitter (C2).
//!
//! Pure round-robin partition of a file list into N balanced batches.

use std::path::PathBuf;

/// One batch: a stable index plus its files in split order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: usize,
    pub files: Vec<PathBuf>,
}

/// Split `files` into `min(requested_batches, files.len())` batches by
/// round-robin (`batches[i % N].push(files[i])`).
///
/// - Empty `files` -> empty result.
/// - `requested_batches <= 0` -> a single batch containing every file.
pub fn split_into_batches(files: &[PathBuf], requested_batches: i64) -> Vec<Batch> {
    if files.is_empty() {
        return Vec::new();
    }

    let n = if requested_batches <= 0 {
        1
    } else {
        (requested_batches as usize).min(files.len())
    };

    let mut batches: Vec<Batch> = (0..n).map(|id| Batch { id, files: Vec::new() }).collect();
    for (i, file) in files.iter().enumerate() {
        batches[i % n].files.push(file.clone());
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("f{i}.dcm"))).collect()
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(split_into_batches(&[], 4).is_empty());
    }

    #[test]
    fn non_positive_request_yields_a_single_batch() {
        let files = paths(5);
        let batches = split_into_batches(&files, 0);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].files.len(), 5);
    }

    #[test]
    fn more_batches_than_files_caps_at_file_count() {
        let files = paths(3);
        let batches = split_into_batches(&files, 10);
        assert_eq!(batches.len(), 3);
        for batch in &batches {
            assert_eq!(batch.files.len(), 1);
        }
    }

    #[test]
    fn round_robin_matches_the_worked_example() {
        let files = vec![
            PathBuf::from("a.dcm"),
            PathBuf::from("b.dcm"),
            PathBuf::from("c.dcm"),
        ];
        let batches = split_into_batches(&files, 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].files, vec![PathBuf::from("a.dcm"), PathBuf::from("c.dcm")]);
        assert_eq!(batches[1].files, vec![PathBuf::from("b.dcm")]);
    }

    #[test]
    fn partition_invariant_holds_for_various_sizes() {
        for file_count in 1..=37usize {
            for requested in 1..=9i64 {
                let files = paths(file_count);
                let batches = split_into_batches(&files, requested);
                let total: usize = batches.iter().map(|b| b.files.len()).sum();
                assert_eq!(total, file_count);
                let sizes: Vec<usize> = batches.iter().map(|b| b.files.len()).collect();
                let min = *sizes.iter().min().unwrap();
                let max = *sizes.iter().max().unwrap();
                assert!(max - min <= 1);
                let ids: Vec<usize> = batches.iter().map(|b| b.id).collect();
                assert_eq!(ids, (0..batches.len()).collect::<Vec<_>>());
            }
        }
    }
}
