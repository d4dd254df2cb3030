//! Locating per-target input files.
//!
//! Fan-out stages look up their inputs inside each target directory by file
//! name, at any depth.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// First file named `file_name` under `dir`, in sorted walk order.
pub fn find_input(dir: &Path, file_name: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name() == file_name)
        .map(|entry| entry.into_path())
}

/// Create `dir` (and parents) if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_nested_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let nested = temp.path().join("dicom/series1");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(nested.join("b0.nii"), b"").expect("write");

        let found = find_input(temp.path(), "b0.nii").expect("found");
        assert_eq!(found, nested.join("b0.nii"));
    }

    #[test]
    fn prefers_first_in_sorted_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        for dir in ["b", "a"] {
            fs::create_dir_all(temp.path().join(dir)).expect("mkdir");
            fs::write(temp.path().join(dir).join("adc.nii"), b"").expect("write");
        }
        let found = find_input(temp.path(), "adc.nii").expect("found");
        assert_eq!(found, temp.path().join("a/adc.nii"));
    }

    #[test]
    fn missing_file_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(find_input(temp.path(), "asl.nii").is_none());
    }

    #[test]
    fn directories_do_not_match() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("b0.nii")).expect("mkdir");
        assert!(find_input(temp.path(), "b0.nii").is_none());
    }
}
