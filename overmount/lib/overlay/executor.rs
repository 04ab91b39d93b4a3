use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
};

use getset::Getters;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use tokio::{fs, process::Command, time};
use tracing::{debug, error, info, warn};

use crate::{
    mapping::MappingStore,
    utils::{self, DEFAULT_MOUNT_PROGRAM, DEFAULT_UNMOUNT_PROGRAM, UTILITY_WAIT_TIMEOUT},
    OvermountError, OvermountResult,
};

use super::{
    inject::{build_file_injections, FileInjectionGroup},
    plan::{plan_layer_groups, PlannedLayerGroup},
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A destination file that was renamed aside to make room for an injected
/// symlink.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct RenamedFile {
    /// The original destination path, restored during cleanup.
    original: PathBuf,

    /// Where the file currently sits.
    aside: PathBuf,
}

/// Tracks every filesystem artifact the engine creates outside the mount
/// primitive so teardown can reverse it.
///
/// Accumulated during mount and injection, consumed and cleared during
/// cleanup. Losing this ledger leaks whiteout nodes, directories and
/// renamed-aside files.
#[derive(Debug, Default, Getters)]
#[getset(get = "pub")]
pub struct CleanupLedger {
    /// Whiteout device nodes created inside upper layers, in creation order.
    whiteout_files: Vec<PathBuf>,

    /// Intermediate directories created for whiteout nodes, in creation order.
    created_dirs: Vec<PathBuf>,

    /// Symlinks generated for file injection.
    symlinks: Vec<PathBuf>,

    /// Destination files renamed aside during file injection.
    renamed: Vec<RenamedFile>,
}

/// Mount-side state of the engine: the planned groups, the cleanup ledger and
/// the external utility configuration. Guarded by the engine's mount lock.
#[derive(Debug)]
pub struct MountState {
    /// Planned directory groups for the current mount cycle.
    groups: Vec<PlannedLayerGroup>,

    /// File-injection groups for the current mount cycle.
    file_groups: Vec<FileInjectionGroup>,

    /// Record of filesystem artifacts to reverse on teardown.
    ledger: CleanupLedger,

    /// True only after every planned group mounted successfully.
    mounted: bool,

    /// The overlay-mount utility.
    mount_program: PathBuf,

    /// The unmount utility.
    unmount_program: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CleanupLedger {
    pub(crate) fn record_whiteout(&mut self, path: PathBuf) {
        self.whiteout_files.push(path);
    }

    pub(crate) fn record_created_dir(&mut self, path: PathBuf) {
        self.created_dirs.push(path);
    }

    pub(crate) fn record_symlink(&mut self, path: PathBuf) {
        self.symlinks.push(path);
    }

    pub(crate) fn record_renamed(&mut self, original: PathBuf, aside: PathBuf) {
        self.renamed.push(RenamedFile { original, aside });
    }

    /// Whether the ledger holds no artifacts.
    pub fn is_empty(&self) -> bool {
        self.whiteout_files.is_empty()
            && self.created_dirs.is_empty()
            && self.symlinks.is_empty()
            && self.renamed.is_empty()
    }

    fn clear(&mut self) {
        self.whiteout_files.clear();
        self.created_dirs.clear();
        self.symlinks.clear();
        self.renamed.clear();
    }
}

impl MountState {
    /// Creates mount state with the default utility configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the last mount cycle completed for every group.
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Whether any group from a previous attempt is still marked mounted.
    pub fn has_mounted_groups(&self) -> bool {
        self.groups.iter().any(|g| g.mounted())
            || self.file_groups.iter().any(|g| g.mounted())
    }

    /// The planned directory groups of the current cycle.
    pub fn groups(&self) -> &[PlannedLayerGroup] {
        &self.groups
    }

    /// The file-injection groups of the current cycle.
    pub fn file_groups(&self) -> &[FileInjectionGroup] {
        &self.file_groups
    }

    /// The cleanup ledger of the current cycle.
    pub fn ledger(&self) -> &CleanupLedger {
        &self.ledger
    }

    /// Overrides the overlay-mount utility.
    pub fn set_mount_program(&mut self, program: impl Into<PathBuf>) {
        self.mount_program = program.into();
    }

    /// Overrides the unmount utility.
    pub fn set_unmount_program(&mut self, program: impl Into<PathBuf>) {
        self.unmount_program = program.into();
    }

    /// Plans and executes the full mount sequence from the current mapping
    /// state.
    ///
    /// Already mounted is a no-op success. Mounted groups left behind by a
    /// previously failed attempt make this fail fast until `unmount_all`
    /// clears them. If the sequence fails before any group mounted, the
    /// artifacts created so far are reversed so the next attempt starts
    /// clean.
    pub(crate) async fn mount_from(
        &mut self,
        store: &MappingStore,
        debug_mode: bool,
    ) -> OvermountResult<()> {
        debug!("mounting");

        if self.mounted {
            debug!("already mounted");
            return Ok(());
        }
        if self.has_mounted_groups() {
            return Err(OvermountError::PartialMount);
        }

        let result = self.mount_sequence(store, debug_mode).await;

        if result.is_err() && !self.has_mounted_groups() {
            debug!("mount failed before any group was mounted, reverting artifacts");
            self.rollback_unmounted().await;
        }

        result
    }

    async fn mount_sequence(
        &mut self,
        store: &MappingStore,
        debug_mode: bool,
    ) -> OvermountResult<()> {
        self.groups = plan_layer_groups(store).await?;
        self.file_groups =
            build_file_injections(store.file_mappings(), &self.groups, &mut self.ledger).await?;

        let mount_program = resolve_program(&self.mount_program)?;

        let MountState {
            groups,
            file_groups,
            ledger,
            ..
        } = self;

        for group in groups.iter_mut() {
            materialize_whiteouts(group, ledger).await?;
            let args = directory_mount_args(group, debug_mode);
            run_utility(&mount_program, &args, group.target()).await?;
            group.set_mounted(true);
        }

        for group in file_groups.iter_mut() {
            let args = file_mount_args(group, debug_mode);
            run_utility(&mount_program, &args, group.target()).await?;
            group.set_mounted(true);
        }

        self.mounted = true;
        Ok(())
    }

    /// Reverses every currently-mounted group and releases tracked artifacts.
    ///
    /// A utility failure aborts the call and leaves the remaining state in
    /// place for the next attempt; whiteout removal for a group only happens
    /// after that group's unmount succeeded. On success the ledger and the
    /// group sequences are cleared unconditionally.
    pub(crate) async fn unmount_all(&mut self) -> OvermountResult<()> {
        debug!("unmounting");

        if self.groups.is_empty() && self.file_groups.is_empty() {
            debug!("nothing to unmount");
            self.mounted = false;
            return Ok(());
        }

        let unmount_program = resolve_program(&self.unmount_program)?;

        for group in self.groups.iter_mut() {
            // can be false on partial mounts
            if !group.mounted() {
                continue;
            }

            let args = [OsString::from(group.target())];
            run_utility(&unmount_program, &args, group.target()).await?;
            debug!("umount {} success", group.target().display());
            group.set_mounted(false);

            remove_group_whiteouts(group).await;
        }

        for group in self.file_groups.iter_mut() {
            if !group.mounted() {
                continue;
            }

            let args = [OsString::from(group.target())];
            run_utility(&unmount_program, &args, group.target()).await?;
            debug!("umount {} success", group.target().display());
            group.set_mounted(false);
        }

        // whiteouts materialized for groups that never mounted are not part of
        // any active mount and would otherwise leak
        let remaining = std::mem::take(&mut self.ledger.whiteout_files);
        for node in &remaining {
            if fs::symlink_metadata(node).await.is_ok() {
                remove_whiteout_node(node).await;
            }
        }

        self.release_artifacts().await;

        self.ledger.clear();
        self.groups.clear();
        self.file_groups.clear();
        self.mounted = false;
        Ok(())
    }

    /// Best-effort reversal after a mount attempt that mounted nothing.
    pub(crate) async fn rollback_unmounted(&mut self) {
        let whiteouts = std::mem::take(&mut self.ledger.whiteout_files);
        for node in &whiteouts {
            remove_whiteout_node(node).await;
        }

        self.release_artifacts().await;

        self.ledger.clear();
        self.groups.clear();
        self.file_groups.clear();
    }

    /// Removes tracked directories and symlinks and restores renamed files.
    /// Teardown keeps going on individual failures; releasing as much as
    /// possible wins over aborting.
    async fn release_artifacts(&mut self) {
        // deepest first, a shallow directory cannot be removed while a deeper
        // one still exists inside it
        for dir in self.ledger.created_dirs.iter().rev() {
            match utils::is_empty_dir(dir).await {
                Ok(true) => {
                    if let Err(e) = fs::remove_dir(dir).await {
                        warn!("could not remove directory {}: {}", dir.display(), e);
                    }
                }
                Ok(false) => {
                    warn!("not removing non-empty directory {}", dir.display());
                }
                Err(e) => {
                    debug!("skipping directory {}: {}", dir.display(), e);
                }
            }
        }

        for link in &self.ledger.symlinks {
            if let Err(e) = fs::remove_file(link).await {
                debug!("could not remove symlink {}: {}", link.display(), e);
            }
        }

        for renamed in &self.ledger.renamed {
            if fs::symlink_metadata(renamed.aside()).await.is_err() {
                continue;
            }
            if let Err(e) = fs::rename(renamed.aside(), renamed.original()).await {
                error!(
                    "could not restore {} from {}: {}",
                    renamed.original().display(),
                    renamed.aside().display(),
                    e
                );
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates the whiteout device nodes for a group inside its upper layer.
///
/// Whiteouts are zero-size character devices with device number 0/0, the
/// on-disk convention the composition primitive reads as "this path is absent
/// in the merged view". Created parent directories and nodes are recorded in
/// the ledger. A group without a writable layer cannot express whiteouts;
/// they degrade to a warning.
async fn materialize_whiteouts(
    group: &PlannedLayerGroup,
    ledger: &mut CleanupLedger,
) -> OvermountResult<()> {
    let upper = match group.upper_dir() {
        Some(upper) => upper,
        None => {
            if !group.whiteout().is_empty() {
                warn!("cannot create whiteout files without upper dir");
            }
            return Ok(());
        }
    };

    for relative in group.whiteout() {
        let node = upper.join(relative);

        if let Some(parent) = node.parent() {
            for dir in missing_ancestors(parent) {
                ledger.record_created_dir(dir);
            }
            fs::create_dir_all(parent).await?;
        }

        mknod(&node, SFlag::S_IFCHR, Mode::empty(), makedev(0, 0)).map_err(|e| {
            OvermountError::WhiteoutCreate {
                path: node.display().to_string(),
                source: e,
            }
        })?;

        debug!("created whiteout file {}", node.display());
        ledger.record_whiteout(node);
    }

    Ok(())
}

/// Deletes the whiteout nodes of an unmounted group.
async fn remove_group_whiteouts(group: &PlannedLayerGroup) {
    let upper = match group.upper_dir() {
        Some(upper) => upper,
        None => return,
    };

    for relative in group.whiteout() {
        remove_whiteout_node(&upper.join(relative)).await;
    }
}

/// Deletes a single tracked whiteout node after verifying it is still the
/// zero-size device node the engine created. A nonzero size means something
/// else overwrote it; deleting that would destroy data.
async fn remove_whiteout_node(node: &Path) {
    let metadata = match fs::symlink_metadata(node).await {
        Ok(metadata) => metadata,
        Err(e) => {
            debug!("whiteout file {} not inspectable: {}", node.display(), e);
            return;
        }
    };

    if metadata.len() != 0 {
        error!(
            "[umount] whiteout file {} size should be 0, but is {}",
            node.display(),
            metadata.len()
        );
        return;
    }

    match fs::remove_file(node).await {
        Ok(()) => debug!("[umount] deleted whiteout file {}", node.display()),
        Err(e) => error!(
            "[umount] could not remove whiteout file {}: {}",
            node.display(),
            e
        ),
    }
}

/// Ancestors of `dir` that do not exist yet, shallowest first.
fn missing_ancestors(dir: &Path) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    let mut current = Some(dir);

    while let Some(path) = current {
        if path.as_os_str().is_empty() || path.exists() {
            break;
        }
        missing.push(path.to_path_buf());
        current = path.parent();
    }

    missing.reverse();
    missing
}

/// Builds the utility arguments for a directory group.
///
/// The destination itself is appended to the lower-dir list so pre-existing
/// destination content stays visible in the merged view.
fn directory_mount_args(group: &PlannedLayerGroup, debug_mode: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    if debug_mode {
        args.push("--debug".into());
    }

    match (group.upper_dir(), group.work_dir()) {
        (Some(upper), Some(work)) => {
            args.push("-o".into());
            args.push(option_arg("upperdir=", upper));
            args.push("-o".into());
            args.push(option_arg("workdir=", work.path()));
        }
        // no writable layer, compose read-only
        _ => {}
    }

    args.push("-o".into());
    let mut lower = OsString::from("lowerdir=");
    for dir in group.lower_dirs() {
        lower.push(dir);
        lower.push(":");
    }
    lower.push(group.target());
    args.push(lower);

    args.push(group.target().into());
    args
}

/// Builds the utility arguments for a file-injection group. The destination
/// is the sole lower layer; the symlink-bearing temporary directory overlays
/// it.
fn file_mount_args(group: &FileInjectionGroup, debug_mode: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    if debug_mode {
        args.push("--debug".into());
    }

    args.push("-o".into());
    args.push(option_arg("upperdir=", group.upper_dir().path()));
    args.push("-o".into());
    args.push(option_arg("workdir=", group.work_dir().path()));
    args.push("-o".into());
    args.push(option_arg("lowerdir=", group.target()));

    args.push(group.target().into());
    args
}

fn option_arg(prefix: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(path);
    arg
}

/// Resolves a configured utility to an executable path. Bare names go through
/// the `PATH` lookup; anything with a directory component is used as-is.
fn resolve_program(program: &Path) -> OvermountResult<PathBuf> {
    if program.components().count() > 1 {
        return Ok(program.to_path_buf());
    }

    which::which(program).map_err(|e| OvermountError::UtilityNotFound {
        program: program.display().to_string(),
        source: e,
    })
}

/// Runs an external utility synchronously with the fixed wait bound and logs
/// its merged output line by line.
///
/// A timeout only stops the wait; the utility may still be running when the
/// error is reported.
async fn run_utility(program: &Path, args: &[OsString], target: &Path) -> OvermountResult<()> {
    debug!(
        "running \"{} {}\"",
        program.display(),
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OvermountError::ProcessSpawn {
            name: program.display().to_string(),
            source: e,
        })?;

    let output = match time::timeout(UTILITY_WAIT_TIMEOUT, child.wait_with_output()).await {
        Ok(waited) => waited?,
        Err(_) => {
            return Err(OvermountError::UtilityTimeout {
                program: program.display().to_string(),
                target: target.display().to_string(),
            });
        }
    };

    let merged = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    for line in merged.lines().filter(|line| !line.is_empty()) {
        info!("{}", line);
    }

    if !output.status.success() {
        return Err(OvermountError::UtilityFailed {
            program: program.display().to_string(),
            target: target.display().to_string(),
            status: output.status,
            output: merged.trim().to_string(),
        });
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for MountState {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            file_groups: Vec::new(),
            ledger: CleanupLedger::default(),
            mounted: false,
            mount_program: PathBuf::from(DEFAULT_MOUNT_PROGRAM),
            unmount_program: PathBuf::from(DEFAULT_UNMOUNT_PROGRAM),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileTypeExt;

    use nix::unistd::Uid;
    use tempfile::tempdir;

    use crate::mapping::MappingStore;

    use super::*;

    async fn write_stub(dir: &Path, name: &str, body: &str) -> anyhow::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).await?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        Ok(path)
    }

    #[tokio::test]
    async fn test_directory_mount_args_append_destination_as_lowest_layer() -> anyhow::Result<()> {
        let group = PlannedLayerGroup::new(
            PathBuf::from("/game"),
            Some(PathBuf::from("/upper")),
            None,
            vec![PathBuf::from("/c"), PathBuf::from("/b"), PathBuf::from("/a")],
            vec![],
        );

        let args = directory_mount_args(&group, false);

        // no work dir, so the group degrades to read-only composition
        assert_eq!(
            args,
            vec![
                OsString::from("-o"),
                OsString::from("lowerdir=/c:/b:/a:/game"),
                OsString::from("/game"),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_mount_args_include_upper_and_work_dir() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let work = tempfile::Builder::new().tempdir_in(temp.path())?;
        let work_path = work.path().to_path_buf();

        let group = PlannedLayerGroup::new(
            PathBuf::from("/game"),
            Some(PathBuf::from("/upper")),
            Some(work),
            vec![PathBuf::from("/a")],
            vec![],
        );

        let args = directory_mount_args(&group, true);

        assert_eq!(args[0], OsString::from("--debug"));
        assert_eq!(args[2], OsString::from("upperdir=/upper"));
        assert_eq!(args[4], option_arg("workdir=", &work_path));
        assert_eq!(args[6], OsString::from("lowerdir=/a:/game"));
        assert_eq!(args[7], OsString::from("/game"));
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_from_fails_fast_on_partially_mounted_groups() -> anyhow::Result<()> {
        let mut group =
            PlannedLayerGroup::new(PathBuf::from("/game"), None, None, vec![], vec![]);
        group.set_mounted(true);

        let mut state = MountState::new();
        state.groups.push(group);

        let store = MappingStore::new();
        let result = state.mount_from(&store, false).await;

        assert!(matches!(result, Err(OvermountError::PartialMount)));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_mount_with_no_mounted_groups_rolls_back() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("mod");
        let target = temp.path().join("game");
        fs::create_dir_all(&source).await?;
        fs::create_dir_all(&target).await?;

        let mut store = MappingStore::new();
        store.add_directory(&source, &target, false).await?;

        let mut state = MountState::new();
        let failing = write_stub(temp.path(), "mount-fail.sh", "echo stub failure; exit 7").await?;
        state.set_mount_program(&failing);

        let result = state.mount_from(&store, false).await;
        assert!(matches!(result, Err(OvermountError::UtilityFailed { .. })));

        // nothing mounted, so the next attempt starts from a clean slate
        assert!(state.groups().is_empty());
        assert!(state.ledger().is_empty());
        assert!(!state.is_mounted());
        Ok(())
    }

    #[tokio::test]
    async fn test_utility_timeout_is_reported() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let slow = write_stub(temp.path(), "slow.sh", "sleep 60").await?;

        tokio::time::pause();
        let waited = tokio::spawn({
            let slow = slow.clone();
            async move { run_utility(&slow, &[], Path::new("/game")).await }
        });
        tokio::time::advance(UTILITY_WAIT_TIMEOUT * 2).await;
        let result = waited.await?;

        assert!(matches!(result, Err(OvermountError::UtilityTimeout { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_whiteout_nodes_round_trip() -> anyhow::Result<()> {
        if !Uid::effective().is_root() {
            eprintln!("skipping whiteout round trip, mknod needs root");
            return Ok(());
        }

        let temp = tempdir()?;
        let upper = temp.path().join("upper");
        fs::create_dir(&upper).await?;

        let group = PlannedLayerGroup::new(
            temp.path().join("game"),
            Some(upper.clone()),
            None,
            vec![],
            vec![PathBuf::from("textures/old.bak"), PathBuf::from(".git")],
        );

        let mut ledger = CleanupLedger::default();
        materialize_whiteouts(&group, &mut ledger).await?;

        let node = upper.join("textures/old.bak");
        let metadata = fs::symlink_metadata(&node).await?;
        assert!(metadata.file_type().is_char_device());
        assert_eq!(metadata.len(), 0);
        assert_eq!(ledger.created_dirs(), &vec![upper.join("textures")]);
        assert_eq!(ledger.whiteout_files().len(), 2);

        remove_group_whiteouts(&group).await;
        assert!(fs::symlink_metadata(&node).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_nonzero_whiteout_is_left_in_place() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let node = temp.path().join("overwritten");
        fs::write(&node, "not a device node").await?;

        remove_whiteout_node(&node).await;

        assert!(node.exists(), "overwritten whiteout must not be deleted");
        Ok(())
    }
}
