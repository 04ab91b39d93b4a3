use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::{process::Command, sync::Mutex};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::{
    mapping::MappingStore,
    overlay::{plan_layer_groups, MountState, PlannedLayerGroup},
    OvermountError, OvermountResult,
};

use super::process::{split_command_line, SupervisedProcess};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The overlay filesystem engine.
///
/// Composes a virtual directory namespace from the configured mappings,
/// realizes it as a stack of overlay mounts through the external mount
/// utility, and supervises client processes that depend on the mounted view.
///
/// The engine is an explicitly constructed, shareable instance; wrap it in an
/// [`Arc`] to call it from several tasks or threads. Two mutual-exclusion
/// domains coordinate callers: the data lock guards mapping and blacklist
/// state, the mount lock guards the plan/execute/teardown sequence. Operations
/// that need both acquire the mount lock first, so a mapping change can never
/// be observed mid-mount.
///
/// ## Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use overmount::runtime::OverlayFsManager;
///
/// # async fn example() -> anyhow::Result<()> {
/// let engine = Arc::new(OverlayFsManager::new());
/// engine.add_directory("/mods/texture_pack", "/game/data", false).await?;
/// engine.add_skip_directory(".git").await;
///
/// engine.create_process("/game/bin/launcher", "--windowed").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct OverlayFsManager {
    /// Mapping and blacklist state. Locked after `mount` when both are held.
    data: Arc<Mutex<MappingStore>>,

    /// Mount-cycle state. The outer lock of the two. Shared with the reaper
    /// tasks of supervised processes.
    mount: Arc<Mutex<MountState>>,

    /// Registry of client processes started through the engine.
    processes: Mutex<Vec<SupervisedProcess>>,

    /// Passes `--debug` to the overlay-mount utility. Can be very noisy.
    debug_mode: AtomicBool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OverlayFsManager {
    /// Creates a new engine with no mappings.
    pub fn new() -> Self {
        Self::default()
    }

    /// The engine version string.
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Enables or disables passing `--debug` to the mount utility.
    pub fn set_debug_mode(&self, value: bool) {
        self.debug_mode.store(value, Ordering::Relaxed);
    }

    /// Sets the default upper directory, optionally creating it.
    ///
    /// Must be on the same filesystem as the work directory.
    pub async fn set_upper_dir(
        &self,
        directory: impl Into<PathBuf>,
        create: bool,
    ) -> OvermountResult<()> {
        self.data.lock().await.set_upper_dir(directory, create).await
    }

    /// Sets the work directory, optionally creating it.
    ///
    /// Must be on the same filesystem as the upper directory.
    pub async fn set_work_dir(
        &self,
        directory: impl Into<PathBuf>,
        create: bool,
    ) -> OvermountResult<()> {
        self.data.lock().await.set_work_dir(directory, create).await
    }

    /// Adds a directory mapping. See [`MappingStore::add_directory`].
    pub async fn add_directory(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        create: bool,
    ) -> OvermountResult<()> {
        self.data
            .lock()
            .await
            .add_directory(source, destination, create)
            .await
    }

    /// Adds a file mapping. See [`MappingStore::add_file`].
    pub async fn add_file(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> OvermountResult<()> {
        self.data.lock().await.add_file(source, destination).await
    }

    /// Removes a directory mapping by exact pair. Returns whether one existed.
    pub async fn remove_directory(&self, source: &Path, destination: &Path) -> bool {
        self.data.lock().await.remove_directory(source, destination)
    }

    /// Removes a file mapping by exact resolved pair. Returns whether one existed.
    pub async fn remove_file(&self, source: &Path, destination: &Path) -> bool {
        self.data.lock().await.remove_file(source, destination)
    }

    /// Clears all directory and file mappings.
    pub async fn clear_mappings(&self) {
        self.data.lock().await.clear_mappings();
    }

    /// Adds a directory name to exclude from the merged view at any depth.
    pub async fn add_skip_directory(&self, directory: impl Into<String>) {
        self.data.lock().await.add_skip_directory(directory);
    }

    /// Clears the directory skip-list.
    pub async fn clear_skip_directories(&self) {
        self.data.lock().await.clear_skip_directories();
    }

    /// Adds a filename suffix to exclude from the merged view.
    pub async fn add_skip_file_suffix(&self, suffix: impl Into<String>) {
        self.data.lock().await.add_skip_file_suffix(suffix);
    }

    /// Clears the file suffix skip-list.
    pub async fn clear_skip_file_suffixes(&self) {
        self.data.lock().await.clear_skip_file_suffixes();
    }

    /// Records a library to force-load into the given client process.
    ///
    /// Declared configuration only; the mount and process-creation paths do
    /// not consult the list yet.
    pub async fn force_load_library(
        &self,
        process_name: impl Into<PathBuf>,
        library_path: impl Into<PathBuf>,
    ) {
        self.data
            .lock()
            .await
            .force_load_library(process_name, library_path);
    }

    /// Clears all recorded force-load libraries.
    pub async fn clear_library_force_loads(&self) {
        self.data.lock().await.clear_library_force_loads();
    }

    /// Overrides the overlay-mount utility (resolved via `PATH` for bare names).
    pub async fn set_mount_program(&self, program: impl Into<PathBuf>) {
        self.mount.lock().await.set_mount_program(program);
    }

    /// Overrides the unmount utility (resolved via `PATH` for bare names).
    pub async fn set_unmount_program(&self, program: impl Into<PathBuf>) {
        self.mount.lock().await.set_unmount_program(program);
    }

    /// Whether the last mount cycle completed for every group.
    pub async fn is_mounted(&self) -> bool {
        // lock in case a mount operation is pending
        self.mount.lock().await.is_mounted()
    }

    /// Plans and executes the full mount sequence.
    ///
    /// Already mounted is a no-op success. Fails fast without touching the
    /// filesystem if a previous attempt left groups mounted.
    pub async fn mount(&self) -> OvermountResult<()> {
        let mut state = self.mount.lock().await;
        let store = self.data.lock().await;
        state
            .mount_from(&store, self.debug_mode.load(Ordering::Relaxed))
            .await
    }

    /// Reverses every currently-mounted group and releases tracked artifacts.
    pub async fn umount(&self) -> OvermountResult<()> {
        let mut state = self.mount.lock().await;
        let _store = self.data.lock().await;
        state.unmount_all().await
    }

    /// Plans the mount sequence without executing it and logs the result.
    ///
    /// Returns the planned groups for inspection; dropping them discards the
    /// scoped work directories the plan allocated.
    pub async fn dryrun(&self) -> OvermountResult<Vec<PlannedLayerGroup>> {
        let _state = self.mount.lock().await;
        let store = self.data.lock().await;

        info!("would mount");

        if store.directory_mappings().is_empty() && store.file_mappings().is_empty() {
            info!("nothing");
            return Ok(Vec::new());
        }

        let groups = plan_layer_groups(&store).await?;

        info!("directories");
        for (index, group) in groups.iter().enumerate() {
            info!(" . {}", index);
            for lower in group.lower_dirs() {
                info!(
                    "   . {} -> {}",
                    lower.display(),
                    group.target().display()
                );
            }
            if !group.whiteout().is_empty() {
                info!("ignored files/directories:");
                for whiteout in group.whiteout() {
                    info!("   . {}", whiteout.display());
                }
            }
        }

        info!("files:");
        for mapping in store.file_mappings() {
            info!(
                " . {} -> {}",
                mapping.source().display(),
                mapping.destination().display()
            );
        }

        Ok(groups)
    }

    /// Recursively lists the merged namespace.
    ///
    /// Mounts first if necessary and restores the prior unmounted state
    /// afterwards. The returned listing is an owned copy, not live data.
    pub async fn create_overlayfs_dump(&self) -> OvermountResult<Vec<PathBuf>> {
        let mut state = self.mount.lock().await;
        let store = self.data.lock().await;

        debug!("creating overlayfs dump");

        let was_mounted = state.is_mounted();
        state
            .mount_from(&store, self.debug_mode.load(Ordering::Relaxed))
            .await?;

        let targets: Vec<PathBuf> = state
            .groups()
            .iter()
            .map(|group| group.target().clone())
            .chain(
                state
                    .file_groups()
                    .iter()
                    .map(|group| group.target().clone()),
            )
            .collect();

        let mut listing = Vec::new();
        let mut walk_error = None;
        for target in targets {
            match walk_tree(target).await {
                Ok(paths) => listing.extend(paths),
                Err(e) => {
                    walk_error = Some(e);
                    break;
                }
            }
        }

        if !was_mounted {
            if let Err(e) = state.unmount_all().await {
                error!("could not restore unmounted state after dump: {}", e);
            }
        }

        match walk_error {
            Some(e) => Err(e),
            None => Ok(listing),
        }
    }

    /// Ensures the overlay filesystem is mounted, then starts a client
    /// process.
    ///
    /// A mount failure aborts without starting anything. On success the
    /// engine registers the process and unmounts best-effort once it exits;
    /// the unmount runs on a detached task that acquires the mount lock
    /// fresh, independent of this call.
    pub async fn create_process(
        &self,
        application_name: &str,
        command_line: &str,
    ) -> OvermountResult<u32> {
        let mut state = self.mount.lock().await;
        let store = self.data.lock().await;

        debug!(
            "creating process '{}' with commandline '{}'",
            application_name, command_line
        );

        if !state.is_mounted() {
            if let Err(e) = state
                .mount_from(&store, self.debug_mode.load(Ordering::Relaxed))
                .await
            {
                error!("not starting process because mount failed");
                return Err(e);
            }
        }

        let args = split_command_line(command_line)?;
        let mut child = Command::new(application_name)
            .args(&args)
            .spawn()
            .map_err(|e| OvermountError::ProcessSpawn {
                name: application_name.to_string(),
                source: e,
            })?;

        let pid = child
            .id()
            .ok_or_else(|| OvermountError::ProcessIdNotFound(application_name.to_string()))?;

        debug!("created process with pid {}", pid);
        self.processes
            .lock()
            .await
            .push(SupervisedProcess::new(application_name, pid));

        // the reaper acquires the mount lock fresh, independent of this call
        let mount = Arc::clone(&self.mount);
        let data = Arc::clone(&self.data);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    debug!("process {} finished with {}, unmounting", pid, status);
                    let mut state = mount.lock().await;
                    let _store = data.lock().await;
                    if let Err(e) = state.unmount_all().await {
                        warn!("could not unmount after process {} exited: {}", pid, e);
                    }
                }
                Err(e) => error!("error waiting for process {}: {}", pid, e),
            }
        });

        Ok(pid)
    }

    /// The process identifiers of every client process started through the
    /// engine.
    pub async fn overlayfs_process_list(&self) -> Vec<u32> {
        self.processes
            .lock()
            .await
            .iter()
            .map(|process| process.pid())
            .collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Collects every path below `root`, recursively.
async fn walk_tree(root: PathBuf) -> OvermountResult<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || -> OvermountResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1) {
            let entry = entry.map_err(|e| OvermountError::Io(e.into()))?;
            paths.push(entry.into_path());
        }
        Ok(paths)
    })
    .await?
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for OverlayFsManager {
    fn drop(&mut self) {
        if let Ok(state) = self.mount.try_lock() {
            if state.is_mounted() || state.has_mounted_groups() {
                warn!("engine dropped while mounted, call umount() before dropping");
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
