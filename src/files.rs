//! Atomic file operations built on POSIX rename and symlink semantics.

use std::ffi::OsString;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{symlink, DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::error::Result;

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

// Appends a suffix to the final path component.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Creates all missing directories on `path` with mode 0755.
pub fn ensure_dir(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)?;
    Ok(())
}

/// Writes `data` to `<path>.temp` and renames it over `path`.
///
/// The rename makes the full contents visible atomically: a concurrent
/// reader sees either no file or all of `data`, never a prefix. If `path`
/// already exists the rename silently replaces it, so callers that need
/// creation-only semantics must serialize via a lock or check existence
/// first.
pub fn create_exclusive(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = with_suffix(path, ".temp");
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(&tmp)?;
    f.write_all(data)?;
    drop(f);
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Replaces every partial file under `<full_path>.p/` with a symlink to
/// `full_path`, so URLs for the old partial paths keep resolving after the
/// tile or bundle fills up.
pub fn relink_partials(full_path: &Path) -> Result<()> {
    let partial_dir = with_suffix(full_path, ".p");
    let entries = match fs::read_dir(&partial_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let partial = entry?.path();
        tracing::debug!(
            partial = %partial.display(),
            full = %full_path.display(),
            "relinking partial to full file"
        );
        // POSIX gives no atomic symlink-replace, so create the link at a
        // scratch name and rename it over the partial file.
        let tmp = with_suffix(full_path, ".link");
        let _ = fs::remove_file(&tmp);
        symlink(full_path, &tmp)?;
        fs::rename(&tmp, &partial)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_create_exclusive_writes_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");

        create_exclusive(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        // No temp file left behind.
        assert!(!with_suffix(&path, ".temp").exists());
    }

    #[test]
    fn test_create_exclusive_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");

        create_exclusive(&path, b"one").unwrap();
        create_exclusive(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn test_ensure_dir_nested() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_dir(&nested).unwrap();
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_relink_partials() {
        let dir = TempDir::new().unwrap();
        let full = dir.path().join("000");
        let partial_dir = dir.path().join("000.p");
        ensure_dir(&partial_dir).unwrap();

        create_exclusive(&partial_dir.join("3"), b"partial-3").unwrap();
        create_exclusive(&partial_dir.join("7"), b"partial-7").unwrap();
        create_exclusive(&full, b"full-contents").unwrap();

        relink_partials(&full).unwrap();

        for p in ["3", "7"] {
            let path = partial_dir.join(p);
            assert!(path.symlink_metadata().unwrap().file_type().is_symlink());
            // Old partial URLs now resolve to the full contents.
            assert_eq!(fs::read(&path).unwrap(), b"full-contents");
        }
    }

    #[test]
    fn test_relink_without_partials_is_noop() {
        let dir = TempDir::new().unwrap();
        let full = dir.path().join("000");
        create_exclusive(&full, b"full").unwrap();
        relink_partials(&full).unwrap();
    }
}
