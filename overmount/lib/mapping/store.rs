use std::path::{Path, PathBuf};

use getset::Getters;
use tokio::fs;
use tracing::debug;

use crate::{OvermountError, OvermountResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single (source, destination) mapping.
///
/// Directory mappings compose a source directory into a destination directory;
/// file mappings inject a single source file at a destination path.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Mapping {
    /// The path content is taken from.
    source: PathBuf,

    /// The path the content appears at in the merged view.
    destination: PathBuf,
}

/// A library that should be force-loaded into a named client process.
///
/// Stored configuration only; the mount and process-creation paths do not
/// consult it yet.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct ForceLoadLibrary {
    /// The client process the library applies to.
    process_name: PathBuf,

    /// The library to load into that process.
    library_path: PathBuf,
}

/// Holds directory mappings, file mappings, name/suffix blacklists and the
/// configured default upper and work directories.
///
/// Pure data; the engine mutates it under its data lock. Conflicts between
/// mappings are checked at plan time, not at insertion time, since only the
/// full mapping set determines them.
#[derive(Debug, Default, Getters)]
#[getset(get = "pub")]
pub struct MappingStore {
    /// Directory mappings in insertion order.
    directory_mappings: Vec<Mapping>,

    /// File mappings in insertion order, destinations already resolved to file paths.
    file_mappings: Vec<Mapping>,

    /// Directory names excluded from the merged view wherever they appear.
    directory_blacklist: Vec<String>,

    /// Filename suffixes excluded from the merged view.
    file_suffix_blacklist: Vec<String>,

    /// Declared force-load libraries, not enforced by the mount path.
    force_load_libraries: Vec<ForceLoadLibrary>,

    /// Default writable layer for groups without an `overwrite` source.
    upper_dir: Option<PathBuf>,

    /// Configured work directory. Must share a filesystem with the upper dir.
    work_dir: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Mapping {
    /// Creates a new mapping.
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

impl MappingStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a directory mapping.
    ///
    /// A missing source or destination is created when `create` is true and
    /// rejected otherwise. An existing source or destination that is not a
    /// directory is always rejected. Adding an identical pair twice is a no-op.
    pub async fn add_directory(
        &mut self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        create: bool,
    ) -> OvermountResult<()> {
        let source = source.into();
        let destination = destination.into();

        debug!(
            "adding directory '{}' with destination '{}'",
            source.display(),
            destination.display()
        );

        ensure_directory(&source, create, OvermountError::SourceNotADirectory).await?;
        ensure_directory(&destination, create, OvermountError::DestinationNotADirectory).await?;

        let mapping = Mapping::new(source, destination);
        if self.directory_mappings.contains(&mapping) {
            return Ok(());
        }

        self.directory_mappings.push(mapping);
        Ok(())
    }

    /// Adds a file mapping.
    ///
    /// The source must not be a directory. If the destination is an existing
    /// directory, the source's filename is appended to form the real
    /// destination. Adding an identical resolved pair twice is a no-op.
    pub async fn add_file(
        &mut self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> OvermountResult<()> {
        let source = source.into();
        let destination = destination.into();

        debug!(
            "adding file '{}' with destination '{}'",
            source.display(),
            destination.display()
        );

        if fs::metadata(&source)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
        {
            return Err(OvermountError::SourceIsADirectory(
                source.display().to_string(),
            ));
        }

        let destination = if fs::metadata(&destination)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
        {
            match source.file_name() {
                Some(name) => destination.join(name),
                None => {
                    return Err(OvermountError::custom(anyhow::anyhow!(
                        "file mapping source has no file name: {}",
                        source.display()
                    )))
                }
            }
        } else {
            destination
        };

        let mapping = Mapping::new(source, destination);
        if self.file_mappings.contains(&mapping) {
            return Ok(());
        }

        self.file_mappings.push(mapping);
        Ok(())
    }

    /// Removes a directory mapping by exact (source, destination) pair.
    ///
    /// Returns whether an entry was removed.
    pub fn remove_directory(&mut self, source: &Path, destination: &Path) -> bool {
        let before = self.directory_mappings.len();
        self.directory_mappings
            .retain(|m| m.source() != source || m.destination() != destination);
        self.directory_mappings.len() != before
    }

    /// Removes a file mapping by exact (source, destination) pair.
    ///
    /// Returns whether an entry was removed. The destination must be the
    /// resolved file path, filename included.
    pub fn remove_file(&mut self, source: &Path, destination: &Path) -> bool {
        let before = self.file_mappings.len();
        self.file_mappings
            .retain(|m| m.source() != source || m.destination() != destination);
        self.file_mappings.len() != before
    }

    /// Clears both mapping sequences.
    pub fn clear_mappings(&mut self) {
        self.directory_mappings.clear();
        self.file_mappings.clear();
    }

    /// Adds a directory name to skip during composition.
    ///
    /// Matches the bare name at any depth, so adding `.git` excludes every
    /// `.git` directory found below any source.
    pub fn add_skip_directory(&mut self, directory: impl Into<String>) {
        let directory = directory.into();
        debug!("added skip directory '{}'", directory);
        self.directory_blacklist.push(directory);
    }

    /// Clears the directory skip-list.
    pub fn clear_skip_directories(&mut self) {
        debug!("clearing skip directories");
        self.directory_blacklist.clear();
    }

    /// Adds a filename suffix to skip during composition.
    ///
    /// `.txt` and `some_file.txt` are both valid suffixes, not to be confused
    /// with file extensions.
    pub fn add_skip_file_suffix(&mut self, suffix: impl Into<String>) {
        let suffix = suffix.into();
        debug!("added skip file suffix '{}'", suffix);
        self.file_suffix_blacklist.push(suffix);
    }

    /// Clears the file suffix skip-list.
    pub fn clear_skip_file_suffixes(&mut self) {
        debug!("clearing skip file suffixes");
        self.file_suffix_blacklist.clear();
    }

    /// Records a library to force-load into the given client process.
    pub fn force_load_library(
        &mut self,
        process_name: impl Into<PathBuf>,
        library_path: impl Into<PathBuf>,
    ) {
        let entry = ForceLoadLibrary {
            process_name: process_name.into(),
            library_path: library_path.into(),
        };
        debug!(
            "adding forced library '{}' for process '{}'",
            entry.library_path().display(),
            entry.process_name().display()
        );
        self.force_load_libraries.push(entry);
    }

    /// Clears all recorded force-load libraries.
    pub fn clear_library_force_loads(&mut self) {
        debug!("clearing forced libraries");
        self.force_load_libraries.clear();
    }

    /// Sets the default upper directory, optionally creating it.
    pub async fn set_upper_dir(
        &mut self,
        directory: impl Into<PathBuf>,
        create: bool,
    ) -> OvermountResult<()> {
        let directory = directory.into();
        debug!("setting upper dir to '{}'", directory.display());
        ensure_directory(&directory, create, OvermountError::DestinationNotADirectory).await?;
        self.upper_dir = Some(directory);
        Ok(())
    }

    /// Sets the work directory, optionally creating it.
    ///
    /// Kept for configuration completeness; the planner allocates a fresh
    /// scoped work directory per group next to its upper dir instead of
    /// reusing this one.
    pub async fn set_work_dir(
        &mut self,
        directory: impl Into<PathBuf>,
        create: bool,
    ) -> OvermountResult<()> {
        let directory = directory.into();
        debug!("setting work dir to '{}'", directory.display());
        ensure_directory(&directory, create, OvermountError::DestinationNotADirectory).await?;
        self.work_dir = Some(directory);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Verifies that `path` is a directory, creating it if allowed.
async fn ensure_directory(
    path: &Path,
    create: bool,
    not_a_directory: fn(String) -> OvermountError,
) -> OvermountResult<()> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(not_a_directory(path.display().to_string())),
        Err(_) if create => {
            fs::create_dir_all(path).await?;
            Ok(())
        }
        Err(_) => Err(OvermountError::DirectoryMissing(
            path.display().to_string(),
        )),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_mapping_store_add_directory_is_idempotent() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("mods");
        let destination = temp.path().join("game");

        let mut store = MappingStore::new();
        store.add_directory(&source, &destination, true).await?;
        store.add_directory(&source, &destination, true).await?;

        assert_eq!(store.directory_mappings().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_mapping_store_add_directory_rejects_missing_without_create() -> anyhow::Result<()>
    {
        let temp = tempdir()?;
        let source = temp.path().join("absent");
        let destination = temp.path().join("game");

        let mut store = MappingStore::new();
        let result = store.add_directory(&source, &destination, false).await;

        assert!(matches!(result, Err(OvermountError::DirectoryMissing(_))));
        assert!(store.directory_mappings().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_mapping_store_add_directory_rejects_file_source() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("not_a_dir");
        fs::write(&source, "plain file").await?;
        let destination = temp.path().join("game");

        let mut store = MappingStore::new();
        let result = store.add_directory(&source, &destination, true).await;

        assert!(matches!(
            result,
            Err(OvermountError::SourceNotADirectory(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_mapping_store_add_file_appends_name_for_directory_destination(
    ) -> anyhow::Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("plugin.ini");
        fs::write(&source, "contents").await?;
        let destination = temp.path().join("game");
        fs::create_dir(&destination).await?;

        let mut store = MappingStore::new();
        store.add_file(&source, &destination).await?;

        assert_eq!(
            store.file_mappings()[0].destination(),
            &destination.join("plugin.ini")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_mapping_store_add_file_rejects_directory_source() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("dir_source");
        fs::create_dir(&source).await?;

        let mut store = MappingStore::new();
        let result = store.add_file(&source, temp.path().join("dst.ini")).await;

        assert!(matches!(result, Err(OvermountError::SourceIsADirectory(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_mapping_store_remove_and_clear() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("mods");
        let destination = temp.path().join("game");

        let mut store = MappingStore::new();
        store.add_directory(&source, &destination, true).await?;
        assert!(store.remove_directory(&source, &destination));
        assert!(!store.remove_directory(&source, &destination));

        store.add_directory(&source, &destination, true).await?;
        store.clear_mappings();
        assert!(store.directory_mappings().is_empty());
        Ok(())
    }
}
