//! Where received files land
//!
//! Peers only ever name a file, never a path. The declared name has to be a
//! single plain component that stays under the download directory.

use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};

use crate::protocol::{JOURNAL_FILE, PARTIAL_SUFFIX};

/// Final location for a declared file name. Rejects:
/// 1. Empty names and names containing NUL
/// 2. Anything with more than one path component (separators, `..`, roots)
/// 3. On Windows, ':' (ADS defense)
/// 4. Names that collide with our own partial-file suffix
/// 5. The transfer journal kept alongside received files
pub fn resolve_target(root: &Path, file_name: &str) -> Result<PathBuf> {
    if file_name.trim().is_empty() {
        bail!("empty file name");
    }
    if file_name.contains('\0') {
        bail!("file name contains NUL byte");
    }
    if file_name.contains('/') || file_name.contains('\\') {
        bail!("file name contains a path separator: {:?}", file_name);
    }
    #[cfg(windows)]
    if file_name.contains(':') {
        bail!("file name contains colon (potential ADS attack)");
    }
    if file_name.ends_with(PARTIAL_SUFFIX) {
        bail!("file name uses reserved suffix {}", PARTIAL_SUFFIX);
    }
    if file_name.eq_ignore_ascii_case(JOURNAL_FILE) {
        bail!("file name is reserved: {}", file_name);
    }

    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Ok(root.join(name)),
        (first, _) => bail!("file name has disallowed component: {:?}", first),
    }
}

/// Sibling path the payload is written to until it is complete
pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

/// Duplicate heuristic: same name and same size counts as already present.
/// Distinct files that share both are indistinguishable here.
pub fn already_present(target: &Path, size: u64) -> bool {
    std::fs::metadata(target)
        .map(|md| md.is_file() && md.len() == size)
        .unwrap_or(false)
}

/// The name a local file is announced under
pub fn declared_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(|n| n.to_string())
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("create directory {}", path.display()))?;
    }
    Ok(())
}

/// Best-effort removal of a partial file
pub fn discard(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "could not remove partial file: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_target_safe_names() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let result = resolve_target(root, "setup.exe").unwrap();
        assert_eq!(result, root.join("setup.exe"));

        let result = resolve_target(root, "Office 2019 (x64).msi").unwrap();
        assert!(result.starts_with(root));
    }

    #[test]
    fn test_resolve_target_unsafe_names() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        // Parent directory traversal
        assert!(resolve_target(root, "..").is_err());
        assert!(resolve_target(root, "../etc/passwd").is_err());
        assert!(resolve_target(root, "..\\windows\\system32").is_err());

        // Absolute path and nesting
        assert!(resolve_target(root, "/etc/passwd").is_err());
        assert!(resolve_target(root, "sub/file.txt").is_err());
        assert!(resolve_target(root, ".").is_err());

        // NUL byte, empty, reserved suffix
        assert!(resolve_target(root, "file\0.txt").is_err());
        assert!(resolve_target(root, "  ").is_err());
        assert!(resolve_target(root, "setup.exe.part").is_err());
    }

    #[test]
    fn test_resolve_target_rejects_journal_name() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        assert!(resolve_target(root, JOURNAL_FILE).is_err());
        assert!(resolve_target(root, &JOURNAL_FILE.to_uppercase()).is_err());
        assert!(resolve_target(root, ".lanpush_notes.txt").is_ok());
    }

    #[cfg(windows)]
    #[test]
    fn test_resolve_target_windows_ads() {
        let temp_dir = TempDir::new().unwrap();
        assert!(resolve_target(temp_dir.path(), "file.txt:stream").is_err());
    }

    #[test]
    fn test_partial_path_is_sibling() {
        let p = partial_path(Path::new("/tmp/dl/setup.exe"));
        assert_eq!(p, PathBuf::from("/tmp/dl/setup.exe.part"));
    }

    #[test]
    fn test_already_present_matches_name_and_size() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.bin");
        assert!(!already_present(&file, 4));
        fs::write(&file, b"abcd").unwrap();
        assert!(already_present(&file, 4));
        assert!(!already_present(&file, 5));
        // directories never count
        assert!(!already_present(temp_dir.path(), 0));
    }

    #[test]
    fn test_declared_name() {
        assert_eq!(
            declared_name(Path::new("/srv/pkgs/setup.exe")).as_deref(),
            Some("setup.exe")
        );
        assert_eq!(declared_name(Path::new("/")), None);
    }
}
