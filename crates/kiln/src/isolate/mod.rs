//! IOI Isolate wrapper
//!
//! The production [`Sandbox`](crate::sandbox::Sandbox) backend: a fixed pool of
//! Isolate boxes, each initialized for one job and cleaned up afterwards.
//!
//! References for Isolate's CLI arguments and meta-files:
//! - https://www.ucw.cz/isolate/isolate.1.html
//! - https://github.com/ioi/isolate

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub use crate::isolate::box_manager::{BoxPool, IsolateBox};
pub use crate::isolate::command::{IsolateAction, IsolateCommand};
pub use crate::isolate::meta::{MetaFile, MetaParseError};
pub use crate::isolate::process::IsolateProcess;
use crate::types::MountConfig;

mod box_manager;
mod command;
mod meta;
mod process;

/// Errors that occur during isolate sandbox operations
#[derive(Debug, Error)]
pub enum IsolateError {
    #[error("failed to initialize box {id}: {message}")]
    InitFailed { id: u32, message: String },

    #[error("failed to cleanup box {id}: {message}")]
    CleanupFailed { id: u32, message: String },

    #[error("isolate command failed: {0}")]
    CommandFailed(String),

    #[error("failed to spawn isolate process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to parse meta file: {0}")]
    MetaParseFailed(String),

    #[error("box pool is closed")]
    PoolClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("isolate binary not found at {0}")]
    BinaryNotFound(PathBuf),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("mount source path does not exist: {0}")]
    MountSourceNotFound(String),

    #[error("refusing to read {0}: not a regular file")]
    UnsafeFile(PathBuf),
}

/// Mount point of the unified cgroup hierarchy
const CGROUP_FS: &str = "/sys/fs/cgroup";

/// Controllers each box's cgroup needs
const BOX_CONTROLLERS: &str = "+memory +pids";

/// Make `cg_root` usable as isolate's cgroup parent.
///
/// Normally `isolate-cg-keeper` does this; containers rarely run it. The
/// server moves itself into a leaf cgroup (cgroup v2 forbids controllers on a
/// group that holds processes), then delegates memory and pids down to
/// `cg_root`.
///
/// `Ok(false)` means cgroup v2 or its memory controller is missing and boxes
/// must run with `--mem` (RLIMIT_AS) instead.
pub fn prepare_cgroup(cg_root: &Path) -> Result<bool, IsolateError> {
    let cgroup_fs = Path::new(CGROUP_FS);
    if !has_controller(&cgroup_fs.join("cgroup.controllers"), "memory")? {
        return Ok(false);
    }
    if has_controller(&cg_root.join("cgroup.subtree_control"), "memory")? {
        return Ok(true);
    }

    let leaf = cgroup_fs.join("init");
    ensure_dir(&leaf)?;
    fs::write(leaf.join("cgroup.procs"), std::process::id().to_string())?;
    fs::write(cgroup_fs.join("cgroup.subtree_control"), BOX_CONTROLLERS)?;

    ensure_dir(cg_root)?;
    fs::write(cg_root.join("cgroup.subtree_control"), BOX_CONTROLLERS)?;
    debug!(cg_root = %cg_root.display(), "cgroup hierarchy prepared");
    Ok(true)
}

/// Whether the controller list at `path` names `controller`. A missing file
/// counts as no.
fn has_controller(path: &Path, controller: &str) -> Result<bool, IsolateError> {
    match fs::read_to_string(path) {
        Ok(list) => Ok(list.split_whitespace().any(|c| c == controller)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn ensure_dir(path: &Path) -> Result<(), IsolateError> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Every required mount source must exist on the host; optional ones are
/// dropped by isolate when absent.
pub fn validate_mounts(mounts: &[MountConfig]) -> Result<(), IsolateError> {
    match mounts
        .iter()
        .find(|mount| !mount.optional && !Path::new(&mount.source).exists())
    {
        Some(missing) => Err(IsolateError::MountSourceNotFound(missing.source.clone())),
        None => Ok(()),
    }
}

/// Turn a bare program name such as `gcc` into the canonical host path isolate
/// can `execve`. Anything containing a `/` (`./main`) is taken as given.
///
/// The path is canonicalized because a PATH entry may be a symlink into a
/// directory that is not bound into the box.
pub fn resolve_command(command: &mut [String]) -> Result<(), IsolateError> {
    let Some(program) = command.first_mut() else {
        return Ok(());
    };
    if program.contains('/') {
        return Ok(());
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    let found = std::env::split_paths(&search)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(&*program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            IsolateError::CommandFailed(format!("command '{program}' not found in PATH"))
        })?;

    *program = fs::canonicalize(&found)
        .unwrap_or(found)
        .to_string_lossy()
        .into_owned();
    Ok(())
}

/// Open a file the sandboxed program could have tampered with.
///
/// The final component is not followed and the open never blocks, so a
/// symlink or FIFO planted in the workspace cannot redirect or stall the
/// host-side read. Only a singly linked regular file is accepted. `Ok(None)`
/// when the file does not exist.
pub(crate) async fn open_box_file(path: &Path) -> Result<Option<tokio::fs::File>, IsolateError> {
    let opened = tokio::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)
        .await;
    let file = match opened {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::ELOOP) => {
            return Err(IsolateError::UnsafeFile(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = file.metadata().await?;
    if !metadata.is_file() || metadata.nlink() != 1 {
        return Err(IsolateError::UnsafeFile(path.to_path_buf()));
    }
    Ok(Some(file))
}
