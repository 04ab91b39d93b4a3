//! `overmount` composes a virtual directory namespace from independent source
//! directory trees and individual files, realized as a stack of overlay
//! filesystem mounts driven through the external `fuse-overlayfs` utility.
//!
//! # Overview
//!
//! The engine translates a declarative set of (source, destination) mappings
//! into ordered layer stacks, one per destination:
//!
//! - sources mapped onto the same destination become lower layers, later
//!   mappings taking precedence over earlier ones
//! - a source directory named `overwrite` becomes the group's writable upper
//!   layer
//! - name and suffix blacklists turn into whiteout device nodes that hide the
//!   matching paths from the merged view
//! - single-file mappings are injected through a synthetic upper layer of
//!   symlinks, since the composition primitive only merges directories
//!
//! Every filesystem artifact created along the way is tracked in a cleanup
//! ledger and reversed on unmount. Client processes started through the
//! engine unmount the composition automatically when they exit.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use overmount::runtime::OverlayFsManager;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Arc::new(OverlayFsManager::new());
//!
//!     engine.add_directory("/mods/balance_patch", "/game/data", false).await?;
//!     engine.add_directory("/mods/texture_pack", "/game/data", false).await?;
//!     engine.add_skip_directory(".git").await;
//!     engine.add_skip_file_suffix(".bak").await;
//!
//!     // mounts, runs the game, unmounts when it exits
//!     engine.create_process("/game/bin/launcher", "--windowed").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`mapping`] - Declarative mapping and blacklist state
//! - [`overlay`] - Planning, file injection, execution and teardown
//! - [`runtime`] - The engine facade and process supervision
//! - [`log`] - Tracing subscriber setup
//! - [`utils`] - Common constants and helpers
//!
//! # Platform Support
//!
//! Linux only: whiteouts are character device nodes and the composition is
//! performed by `fuse-overlayfs`.

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod log;
pub mod mapping;
pub mod overlay;
pub mod runtime;
pub mod utils;

pub use error::*;
