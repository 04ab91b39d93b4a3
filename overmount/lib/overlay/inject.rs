use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use getset::{CopyGetters, Getters};
use tempfile::TempDir;
use tokio::fs;
use tracing::debug;

use crate::{
    mapping::Mapping,
    utils::{self, TEMP_DIR_PREFIX},
    OvermountError, OvermountResult,
};

use super::{executor::CleanupLedger, plan::PlannedLayerGroup};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A synthetic overlay layer realizing the file mappings for one destination
/// directory.
///
/// The underlying composition primitive only merges directories, so single
/// files are injected by symlinking them into a scoped temporary upper layer
/// that is then mounted over the destination. The temporary directories (and
/// the symlinks inside them) are removed when the group is dropped.
#[derive(Debug, Getters, CopyGetters)]
pub struct FileInjectionGroup {
    /// The destination directory, which becomes the mount point.
    #[getset(get = "pub")]
    target: PathBuf,

    /// Scoped temporary upper layer holding the generated symlinks.
    #[getset(get = "pub")]
    upper_dir: TempDir,

    /// Scoped temporary scratch directory for the mount primitive.
    #[getset(get = "pub")]
    work_dir: TempDir,

    /// Whether the external utility has successfully mounted this group.
    #[getset(get_copy = "pub")]
    mounted: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileInjectionGroup {
    pub(crate) fn set_mounted(&mut self, mounted: bool) {
        self.mounted = mounted;
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds one [`FileInjectionGroup`] per distinct file-mapping destination
/// directory.
///
/// A destination file that already exists is renamed aside first and recorded
/// in the ledger for restoration during cleanup. Failure aborts the whole
/// injection step; links created before the failure stay recorded in the
/// ledger so the outer mount failure path can reverse them.
pub(crate) async fn build_file_injections(
    file_mappings: &[Mapping],
    directory_groups: &[PlannedLayerGroup],
    ledger: &mut CleanupLedger,
) -> OvermountResult<Vec<FileInjectionGroup>> {
    let destinations: BTreeSet<PathBuf> = file_mappings
        .iter()
        .map(|mapping| destination_dir(mapping.destination()))
        .collect();

    // a destination served by a directory group already has a mount planned
    for group in directory_groups {
        if destinations.contains(group.target()) {
            return Err(OvermountError::FileDestinationCollision(
                group.target().display().to_string(),
            ));
        }
    }

    let mut groups = Vec::with_capacity(destinations.len());

    for destination in destinations {
        debug!("processing file destination {}", destination.display());

        let prefix = match destination.file_name() {
            Some(name) => format!("{}{}", name.to_string_lossy(), TEMP_DIR_PREFIX),
            None => TEMP_DIR_PREFIX.to_string(),
        };
        let parent = utils::temp_parent_dir(&destination);

        let upper_dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(parent)?;
        let work_dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(parent)?;

        debug!("created upper dir {}", upper_dir.path().display());
        debug!("created work dir {}", work_dir.path().display());

        for mapping in file_mappings {
            if destination_dir(mapping.destination()) != destination {
                continue;
            }

            let file_name = mapping.destination().file_name().ok_or_else(|| {
                OvermountError::custom(anyhow::anyhow!(
                    "file mapping destination has no file name: {}",
                    mapping.destination().display()
                ))
            })?;

            // an existing destination file would shadow the injected one
            if fs::symlink_metadata(mapping.destination()).await.is_ok() {
                let aside = utils::rename_aside_path(mapping.destination());
                fs::rename(mapping.destination(), &aside).await?;
                debug!(
                    "renamed existing file {} aside to {}",
                    mapping.destination().display(),
                    aside.display()
                );
                ledger.record_renamed(mapping.destination().clone(), aside);
            }

            let link_path = upper_dir.path().join(file_name);
            fs::symlink(mapping.source(), &link_path).await?;
            debug!(
                "created symlink {} to {}",
                link_path.display(),
                mapping.source().display()
            );
            ledger.record_symlink(link_path);
        }

        groups.push(FileInjectionGroup {
            target: destination,
            upper_dir,
            work_dir,
            mounted: false,
        });
    }

    Ok(groups)
}

/// The directory a file-mapping destination lives in.
fn destination_dir(destination: &Path) -> PathBuf {
    match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::utils::RENAME_ASIDE_SUFFIX;

    use super::*;

    #[tokio::test]
    async fn test_injection_creates_symlinks_in_synthetic_upper() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("plugin.ini");
        fs::write(&source, "injected").await?;
        let destination = temp.path().join("game");
        fs::create_dir(&destination).await?;

        let mappings = vec![Mapping::new(&source, destination.join("plugin.ini"))];
        let mut ledger = CleanupLedger::default();

        let groups = build_file_injections(&mappings, &[], &mut ledger).await?;

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].target(), &destination);

        let link = groups[0].upper_dir().path().join("plugin.ini");
        assert_eq!(fs::read_link(&link).await?, source);
        assert_eq!(ledger.symlinks(), &vec![link]);
        Ok(())
    }

    #[tokio::test]
    async fn test_injection_renames_existing_destination_aside() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("plugin.ini");
        fs::write(&source, "injected").await?;
        let destination = temp.path().join("game");
        fs::create_dir(&destination).await?;
        let occupied = destination.join("plugin.ini");
        fs::write(&occupied, "original").await?;

        let mappings = vec![Mapping::new(&source, &occupied)];
        let mut ledger = CleanupLedger::default();

        build_file_injections(&mappings, &[], &mut ledger).await?;

        let aside = PathBuf::from(format!("{}{}", occupied.display(), RENAME_ASIDE_SUFFIX));
        assert!(!occupied.exists());
        assert_eq!(fs::read_to_string(&aside).await?, "original");
        assert_eq!(ledger.renamed().len(), 1);
        assert_eq!(ledger.renamed()[0].original(), &occupied);
        assert_eq!(ledger.renamed()[0].aside(), &aside);
        Ok(())
    }

    #[tokio::test]
    async fn test_injection_rejects_directory_mapping_destination() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let destination = temp.path().join("game");
        fs::create_dir(&destination).await?;
        let source = temp.path().join("plugin.ini");
        fs::write(&source, "injected").await?;

        let mappings = vec![Mapping::new(&source, destination.join("plugin.ini"))];
        let group = PlannedLayerGroup::new(destination, None, None, vec![], vec![]);
        let mut ledger = CleanupLedger::default();

        let result = build_file_injections(&mappings, &[group], &mut ledger).await;
        assert!(matches!(
            result,
            Err(OvermountError::FileDestinationCollision(_))
        ));
        Ok(())
    }
}
