//! Spec file loader.
//!
//! Discovers and parses test spec files from disk. Each file holds a YAML
//! list of specs.

use crate::schema::Spec;
use std::path::{Path, PathBuf};

/// Error type for spec loading operations.
#[derive(Debug)]
pub enum LoadError {
    /// Failed to read the file.
    Io(std::io::Error),
    /// Failed to parse YAML.
    Yaml(serde_yaml::Error),
    /// Unsupported file extension.
    UnsupportedFormat(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "failed to read file: {e}"),
            LoadError::Yaml(e) => write!(f, "invalid YAML: {e}"),
            LoadError::UnsupportedFormat(ext) => {
                write!(f, "unsupported file format: {ext} (expected .yaml or .yml)")
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// Load the specs contained in a single file.
pub fn load_specs(path: &Path) -> Result<Vec<Spec>, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(LoadError::Io)?;

    match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(LoadError::Yaml),
        other => Err(LoadError::UnsupportedFormat(other.to_string())),
    }
}

/// Find all spec files in a directory or return the single file.
pub fn find_spec_files(path: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    collect_spec_files_recursive(path, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_spec_files_recursive(
    dir: &Path,
    files: &mut Vec<PathBuf>,
) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            collect_spec_files_recursive(&path, files)?;
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && (ext == "yaml" || ext == "yml")
        {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_valid_specs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.yaml");
        std::fs::write(
            &path,
            r#"
- test: one
  steps:
    - in: echo hi
      out: hi
- test: two
  steps:
    - in: "false"
      err: ""
      exit: 1
"#,
        )
        .unwrap();

        let specs = load_specs(&path).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].test, "one");
        assert_eq!(specs[1].test, "two");
    }

    #[test]
    fn load_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "invalid: [yaml: {").unwrap();

        let result = load_specs(&path);
        assert!(matches!(result, Err(LoadError::Yaml(_))));
    }

    #[test]
    fn load_single_document_is_an_error() {
        // A spec file must be a list, matching the schema output.
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.yaml");
        std::fs::write(&path, "test: not-a-list\nsteps: []\n").unwrap();

        let result = load_specs(&path);
        assert!(matches!(result, Err(LoadError::Yaml(_))));
    }

    #[test]
    fn unsupported_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");
        std::fs::write(&path, "").unwrap();

        let result = load_specs(&path);
        assert!(matches!(result, Err(LoadError::UnsupportedFormat(_))));
    }

    #[test]
    fn find_spec_files_in_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "").unwrap();
        std::fs::write(dir.path().join("b.yml"), "").unwrap();
        std::fs::write(dir.path().join("c.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/d.yaml"), "").unwrap();

        let files = find_spec_files(dir.path()).unwrap();
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn find_spec_files_single_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("only.yaml");
        std::fs::write(&path, "").unwrap();

        let files = find_spec_files(&path).unwrap();
        assert_eq!(files, vec![path]);
    }
}
