use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use getset::{CopyGetters, Getters};
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::{
    mapping::MappingStore,
    utils::{self, OVERWRITE_DIR_NAME, TEMP_DIR_PREFIX},
    OvermountError, OvermountResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One planned overlay mount, covering every directory mapping that shares a
/// destination.
///
/// The group owns its scoped work directory; dropping the group removes it.
/// Lifetime spans one mount/unmount cycle, after which the engine clears the
/// group sequence.
#[derive(Debug, Getters, CopyGetters)]
pub struct PlannedLayerGroup {
    /// The destination directory, which becomes the mount point.
    #[getset(get = "pub")]
    target: PathBuf,

    /// The writable layer. `None` composes read-only.
    #[getset(get = "pub")]
    upper_dir: Option<PathBuf>,

    /// Scratch directory required by the mount primitive, on the same
    /// filesystem as the upper dir. Never reused across groups.
    #[getset(get = "pub")]
    work_dir: Option<TempDir>,

    /// Lower layers, highest precedence first.
    #[getset(get = "pub")]
    lower_dirs: Vec<PathBuf>,

    /// Paths to exclude from the merged view, relative to the upper layer.
    #[getset(get = "pub")]
    whiteout: Vec<PathBuf>,

    /// Whether the external utility has successfully mounted this group.
    #[getset(get_copy = "pub")]
    mounted: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PlannedLayerGroup {
    pub(crate) fn new(
        target: PathBuf,
        upper_dir: Option<PathBuf>,
        work_dir: Option<TempDir>,
        lower_dirs: Vec<PathBuf>,
        whiteout: Vec<PathBuf>,
    ) -> Self {
        Self {
            target,
            upper_dir,
            work_dir,
            lower_dirs,
            whiteout,
            mounted: false,
        }
    }

    pub(crate) fn set_mounted(&mut self, mounted: bool) {
        self.mounted = mounted;
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds one [`PlannedLayerGroup`] per distinct directory-mapping destination.
///
/// Fails the whole plan if any path appears as both a source and a destination,
/// if a destination carries more than one `overwrite` source, or if walking a
/// source tree for whiteout derivation fails. No partial plan is returned.
pub async fn plan_layer_groups(store: &MappingStore) -> OvermountResult<Vec<PlannedLayerGroup>> {
    let sources: BTreeSet<&PathBuf> = store
        .directory_mappings()
        .iter()
        .map(|m| m.source())
        .collect();
    let destinations: BTreeSet<&PathBuf> = store
        .directory_mappings()
        .iter()
        .map(|m| m.destination())
        .collect();

    // a layer must never overlay itself
    for source in &sources {
        if destinations.contains(*source) {
            return Err(OvermountError::SourceIsAlsoDestination(
                source.display().to_string(),
            ));
        }
    }

    debug!("planning layer groups:");
    debug!(" . {} sources", sources.len());
    debug!(" . {} destinations", destinations.len());

    let mut groups = Vec::with_capacity(destinations.len());

    for target in destinations {
        let mut override_upper: Option<PathBuf> = None;
        let mut lower_dirs = Vec::new();
        let mut whiteout = Vec::new();

        for mapping in store.directory_mappings() {
            if mapping.destination() != target {
                continue;
            }

            if mapping.source().file_name() == Some(std::ffi::OsStr::new(OVERWRITE_DIR_NAME)) {
                if override_upper.is_some() {
                    return Err(OvermountError::MultipleOverwriteLayers(
                        target.display().to_string(),
                    ));
                }
                override_upper = Some(mapping.source().clone());
                continue;
            }

            lower_dirs.push(mapping.source().clone());
            whiteout.extend(
                derive_whiteouts(
                    mapping.source(),
                    store.directory_blacklist().clone(),
                    store.file_suffix_blacklist().clone(),
                )
                .await?,
            );
        }

        // mapping order expresses highest precedence first, the mount primitive
        // expects the opposite
        lower_dirs.reverse();

        let upper_dir = override_upper
            .or_else(|| store.upper_dir().clone())
            .or_else(|| Some(target.clone()));

        let work_dir = match &upper_dir {
            Some(upper) => Some(
                tempfile::Builder::new()
                    .prefix(TEMP_DIR_PREFIX)
                    .tempdir_in(utils::temp_parent_dir(upper))?,
            ),
            None => None,
        };

        if let Some(work) = &work_dir {
            debug!("created workdir {}", work.path().display());
        }

        groups.push(PlannedLayerGroup::new(
            target.clone(),
            upper_dir,
            work_dir,
            lower_dirs,
            whiteout,
        ));
    }

    Ok(groups)
}

/// Walks a source tree and collects the relative paths excluded by the
/// blacklists.
///
/// A directory whose bare name is blacklisted contributes its relative path
/// and is not descended into; a file whose name ends with a blacklisted
/// suffix contributes its relative path.
async fn derive_whiteouts(
    source: &Path,
    directory_blacklist: Vec<String>,
    suffix_blacklist: Vec<String>,
) -> OvermountResult<Vec<PathBuf>> {
    if directory_blacklist.is_empty() && suffix_blacklist.is_empty() {
        return Ok(Vec::new());
    }

    let root = source.to_path_buf();

    // walkdir is blocking, keep it off the async workers
    tokio::task::spawn_blocking(move || -> OvermountResult<Vec<PathBuf>> {
        let mut excluded = Vec::new();
        let mut walker = WalkDir::new(&root).min_depth(1).into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| OvermountError::Io(e.into()))?;
            let name = entry.file_name().to_string_lossy();

            if entry.file_type().is_dir() {
                if directory_blacklist.iter().any(|dir| dir.as_str() == name) {
                    if let Result::Ok(relative) = entry.path().strip_prefix(&root) {
                        excluded.push(relative.to_path_buf());
                    }
                    walker.skip_current_dir();
                }
            } else if suffix_blacklist
                .iter()
                .any(|suffix| name.ends_with(suffix.as_str()))
            {
                if let Result::Ok(relative) = entry.path().strip_prefix(&root) {
                    excluded.push(relative.to_path_buf());
                }
            }
        }

        Ok(excluded)
    })
    .await?
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tokio::fs;

    use super::*;

    async fn store_with_lowers(
        base: &Path,
        lowers: &[&str],
        target: &Path,
    ) -> anyhow::Result<MappingStore> {
        let mut store = MappingStore::new();
        for lower in lowers {
            store
                .add_directory(base.join(lower), target, true)
                .await?;
        }
        Ok(store)
    }

    #[tokio::test]
    async fn test_plan_reverses_lower_dir_order() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let target = temp.path().join("game");
        let store = store_with_lowers(temp.path(), &["a", "b", "c"], &target).await?;

        let groups = plan_layer_groups(&store).await?;

        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].lower_dirs(),
            &vec![temp.path().join("c"), temp.path().join("b"), temp.path().join("a")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_plan_rejects_source_that_is_also_destination() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let shared = temp.path().join("shared");
        let target = temp.path().join("game");

        let mut store = MappingStore::new();
        store.add_directory(&shared, &target, true).await?;
        store.add_directory(temp.path().join("other"), &shared, true).await?;

        let result = plan_layer_groups(&store).await;
        assert!(matches!(
            result,
            Err(OvermountError::SourceIsAlsoDestination(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_plan_picks_overwrite_source_as_upper_layer() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let target = temp.path().join("game");
        let overwrite = temp.path().join("profile").join("overwrite");

        let mut store = MappingStore::new();
        store.add_directory(temp.path().join("a"), &target, true).await?;
        store.add_directory(&overwrite, &target, true).await?;

        let groups = plan_layer_groups(&store).await?;

        assert_eq!(groups[0].upper_dir(), &Some(overwrite));
        assert_eq!(groups[0].lower_dirs(), &vec![temp.path().join("a")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_plan_rejects_multiple_overwrite_sources() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let target = temp.path().join("game");

        let mut store = MappingStore::new();
        store
            .add_directory(temp.path().join("x").join("overwrite"), &target, true)
            .await?;
        store
            .add_directory(temp.path().join("y").join("overwrite"), &target, true)
            .await?;

        let result = plan_layer_groups(&store).await;
        assert!(matches!(
            result,
            Err(OvermountError::MultipleOverwriteLayers(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_plan_falls_back_to_destination_upper() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let target = temp.path().join("game");
        let store = store_with_lowers(temp.path(), &["a"], &target).await?;

        let groups = plan_layer_groups(&store).await?;

        assert_eq!(groups[0].upper_dir(), &Some(target));
        assert!(groups[0].work_dir().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_plan_prefers_configured_upper_dir() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let target = temp.path().join("game");
        let upper = temp.path().join("upper");

        let mut store = store_with_lowers(temp.path(), &["a"], &target).await?;
        store.set_upper_dir(&upper, true).await?;

        let groups = plan_layer_groups(&store).await?;
        assert_eq!(groups[0].upper_dir(), &Some(upper));
        Ok(())
    }

    #[tokio::test]
    async fn test_whiteouts_from_blacklists() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("mod");
        let target = temp.path().join("game");

        fs::create_dir_all(source.join(".git").join("objects")).await?;
        fs::create_dir_all(source.join("textures")).await?;
        fs::write(source.join("readme.txt"), "keep").await?;
        fs::write(source.join("textures").join("old.bak"), "drop").await?;

        let mut store = MappingStore::new();
        store.add_directory(&source, &target, true).await?;
        store.add_skip_directory(".git");
        store.add_skip_file_suffix(".bak");

        let groups = plan_layer_groups(&store).await?;
        let whiteout = groups[0].whiteout();

        assert!(whiteout.contains(&PathBuf::from(".git")));
        assert!(whiteout.contains(&PathBuf::from("textures/old.bak")));
        // nothing below an excluded directory is listed separately
        assert!(!whiteout.iter().any(|p| p.starts_with(".git/objects")));
        assert_eq!(whiteout.len(), 2);
        Ok(())
    }
}
