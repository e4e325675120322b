//! Local G-code files.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{ConsoleError, Result};

/// Read a G-code file into lines without terminators.
pub fn load_lines(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Err(ConsoleError::LocalFileNotFound {
            path: path.to_path_buf(),
        });
    }
    let content = fs::read_to_string(path)?;
    let lines: Vec<String> = content
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect();
    debug!(path = %path.display(), lines = lines.len(), "Loaded G-code");
    Ok(lines)
}

/// Suggest an 8.3 card name for a local file: the first eight characters
/// of the stem plus ".g".
pub fn dosify(path: &Path) -> String {
    let stem = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .unwrap_or_default();
    let short: String = stem.chars().take(8).collect();
    format!("{}.g", short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_dosify() {
        assert_eq!(dosify(Path::new("/tmp/calibration_cube.gcode")), "calibrat.g");
        assert_eq!(dosify(Path::new("part.g")), "part.g");
        assert_eq!(dosify(Path::new("a.b.c")), "a.g");
    }

    #[test]
    fn test_missing_file() {
        let err = load_lines(&PathBuf::from("/nonexistent/pronto/file.g")).unwrap_err();
        assert!(matches!(err, ConsoleError::LocalFileNotFound { .. }));
    }

    #[test]
    fn test_load_strips_terminators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.g");
        fs::write(&path, "G28\r\nG1 X10\r\nM84\n").unwrap();
        assert_eq!(load_lines(&path).unwrap(), vec!["G28", "G1 X10", "M84"]);
    }
}
