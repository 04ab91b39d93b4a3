use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::fs;

use crate::OvermountResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The reserved directory name that marks a source as a group's writable upper layer.
pub const OVERWRITE_DIR_NAME: &str = "overwrite";

/// Suffix appended to a destination file that gets renamed aside during file injection.
pub const RENAME_ASIDE_SUFFIX: &str = ".overmount-orig";

/// The default overlay-mount utility.
pub const DEFAULT_MOUNT_PROGRAM: &str = "fuse-overlayfs";

/// The default unmount utility.
pub const DEFAULT_UNMOUNT_PROGRAM: &str = "umount";

/// Prefix used for scoped temporary work and upper directories.
pub const TEMP_DIR_PREFIX: &str = "_tmp_";

/// Upper bound on a single invocation of the external mount or unmount utility.
pub const UTILITY_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the path a destination file is renamed to while a symlink shadows it.
pub fn rename_aside_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(RENAME_ASIDE_SUFFIX);
    PathBuf::from(name)
}

/// Returns the directory scoped temporary directories for `path` are allocated in.
///
/// This is the parent of `path`, falling back to the current directory for a
/// bare single-component path.
pub fn temp_parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Checks whether a directory exists and contains no entries.
pub async fn is_empty_dir(path: &Path) -> OvermountResult<bool> {
    let mut entries = fs::read_dir(path).await?;
    Ok(entries.next_entry().await?.is_none())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_aside_path_appends_suffix() {
        let aside = rename_aside_path(Path::new("/data/mods/plugin.ini"));
        assert_eq!(
            aside,
            PathBuf::from(format!("/data/mods/plugin.ini{}", RENAME_ASIDE_SUFFIX))
        );
    }

    #[test]
    fn test_temp_parent_dir_fallback() {
        assert_eq!(temp_parent_dir(Path::new("/a/b")), Path::new("/a"));
        assert_eq!(temp_parent_dir(Path::new("upper")), Path::new("."));
    }

    #[tokio::test]
    async fn test_is_empty_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(is_empty_dir(dir.path()).await?);

        tokio::fs::write(dir.path().join("marker"), "x").await?;
        assert!(!is_empty_dir(dir.path()).await?);

        Ok(())
    }
}
