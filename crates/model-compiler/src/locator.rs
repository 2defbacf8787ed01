//! Model file location
//!
//! A model is named by file and resolved against an ordered list of search
//! directories; the first directory containing the file wins.

use std::path::PathBuf;
use tracing::{debug, trace};

use common::error::{Error, Result};
use pipeline_config::ModelSettings;

/// Describes the model to compile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    /// File name (or relative path) of the network description
    pub file: String,

    /// Candidate directories in priority order
    pub search_dirs: Vec<PathBuf>,

    /// Largest batch the compiled engine will accept
    pub max_batch_size: usize,
}

impl ModelDescriptor {
    /// Creates a descriptor
    pub fn new(file: impl Into<String>, search_dirs: Vec<PathBuf>, max_batch_size: usize) -> Self {
        Self {
            file: file.into(),
            search_dirs,
            max_batch_size,
        }
    }

    /// Resolves the model file against the search directories
    pub fn locate(&self) -> Result<PathBuf> {
        for dir in &self.search_dirs {
            let candidate = dir.join(&self.file);
            trace!("Looking for model at {}", candidate.display());
            if candidate.is_file() {
                debug!("Found model {} at {}", self.file, candidate.display());
                return Ok(candidate);
            }
        }

        let searched: Vec<String> = self
            .search_dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect();

        Err(Error::NotFound(format!(
            "model file '{}' not found in [{}]",
            self.file,
            searched.join(", ")
        )))
    }
}

impl From<&ModelSettings> for ModelDescriptor {
    fn from(settings: &ModelSettings) -> Self {
        Self::new(
            settings.file.clone(),
            settings.search_dirs.clone(),
            settings.max_batch_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_first_match_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(first.path().join("net.json"), "{}").unwrap();
        fs::write(second.path().join("net.json"), "{}").unwrap();

        let descriptor = ModelDescriptor::new(
            "net.json",
            vec![second.path().to_path_buf(), first.path().to_path_buf()],
            1,
        );
        assert_eq!(descriptor.locate().unwrap(), second.path().join("net.json"));
    }

    #[test]
    fn test_skips_directories_without_the_file() {
        let empty = tempfile::tempdir().unwrap();
        let holder = tempfile::tempdir().unwrap();
        fs::write(holder.path().join("net.json"), "{}").unwrap();

        let descriptor = ModelDescriptor::new(
            "net.json",
            vec![PathBuf::from("/nonexistent"), empty.path().to_path_buf(), holder.path().to_path_buf()],
            1,
        );
        assert_eq!(descriptor.locate().unwrap(), holder.path().join("net.json"));
    }

    #[test]
    fn test_missing_everywhere_is_not_found() {
        let empty = tempfile::tempdir().unwrap();
        let descriptor = ModelDescriptor::new("net.json", vec![empty.path().to_path_buf()], 1);
        let err = descriptor.locate().unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("net.json"));
    }

    #[test]
    fn test_directory_with_model_name_is_not_a_match() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("net.json")).unwrap();
        let descriptor = ModelDescriptor::new("net.json", vec![dir.path().to_path_buf()], 1);
        assert!(descriptor.locate().unwrap_err().is_not_found());
    }
}
