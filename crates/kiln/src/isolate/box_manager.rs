//! Box lifecycle management for isolate
//!
//! Manages the initialization, use, and cleanup of Isolate sandbox boxes.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::isolate::{IsolateError, open_box_file};
use crate::isolate::command::{IsolateAction, IsolateCommand};
use crate::isolate::process::IsolateProcess;
use crate::sandbox::{
    Sandbox, SandboxBox, SandboxError, SandboxProcess, SpawnRequest, check_file_name,
};
use crate::types::MountConfig;

/// Settings shared by every box of a pool
#[derive(Debug)]
pub(crate) struct IsolateSettings {
    pub(crate) isolate_path: PathBuf,
    pub(crate) cgroup: bool,
    pub(crate) mounts: Vec<MountConfig>,
}

/// A box ID checked out of the pool. Returns the ID before the permit.
#[derive(Debug)]
struct BoxSlot {
    id: u32,
    free: Arc<Mutex<Vec<u32>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BoxSlot {
    fn drop(&mut self) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.id);
    }
}

/// An initialized Isolate box
///
/// Call [`release`](SandboxBox::release) when done. Dropping an initialized
/// box falls back to a cleanup on a background thread, and the box ID stays
/// checked out until that cleanup finishes.
#[derive(Debug)]
pub struct IsolateBox {
    id: u32,

    /// Box root as printed by `isolate --init`; the workspace is its `box/`
    box_path: PathBuf,

    settings: Arc<IsolateSettings>,
    initialized: bool,
    slot: Option<BoxSlot>,
}

impl IsolateBox {
    #[instrument(skip(settings))]
    pub(crate) async fn init(id: u32, settings: Arc<IsolateSettings>) -> Result<Self, IsolateError> {
        let args = IsolateCommand::new(&settings.isolate_path, id)
            .action(IsolateAction::Init)
            .cgroup(settings.cgroup)
            .build();

        debug!(?args, "initializing isolate box");

        let output = run_isolate(&args).await?;
        if !output.status.success() {
            return Err(IsolateError::InitFailed {
                id,
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        if !box_path.exists() {
            return Err(IsolateError::InitFailed {
                id,
                message: format!("box path does not exist: {}", box_path.display()),
            });
        }

        debug!(?box_path, "box initialized");

        Ok(Self {
            id,
            box_path,
            settings,
            initialized: true,
            slot: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.box_path
    }

    pub(crate) fn settings(&self) -> &IsolateSettings {
        &self.settings
    }

    /// Host path of a file inside the workspace
    pub fn file_path(&self, name: &str) -> Result<PathBuf, IsolateError> {
        check_file_name(name).map_err(|_| {
            IsolateError::InvalidPath(format!("path traversal not allowed: {name}"))
        })?;
        Ok(self.box_path.join("box").join(name))
    }

    /// Path of a workspace file as seen inside the sandbox, where the
    /// workspace is mounted at `/box`
    pub fn sandbox_path(&self, name: &str) -> Result<PathBuf, IsolateError> {
        check_file_name(name).map_err(|_| {
            IsolateError::InvalidPath(format!("path traversal not allowed: {name}"))
        })?;
        Ok(PathBuf::from("/box").join(name))
    }

    /// Host path outside the workspace, unreachable from inside the sandbox
    pub(crate) fn private_path(&self, name: &str) -> PathBuf {
        self.box_path.join(name)
    }

    #[instrument(skip(self), fields(id = self.id))]
    pub async fn cleanup(&mut self) -> Result<(), IsolateError> {
        if !self.initialized {
            return Ok(());
        }

        let args = IsolateCommand::new(&self.settings.isolate_path, self.id)
            .action(IsolateAction::Cleanup)
            .cgroup(self.settings.cgroup)
            .build();

        debug!(?args, "cleaning up isolate box");

        let output = run_isolate(&args).await;
        // A failed cleanup is not retried on drop: the ID may already be reused.
        self.initialized = false;
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(stderr = %stderr, "cleanup failed");
            return Err(IsolateError::CleanupFailed {
                id: self.id,
                message: stderr.trim().to_owned(),
            });
        }

        debug!("box cleaned up");
        Ok(())
    }

    fn with_slot(mut self, slot: BoxSlot) -> Self {
        self.slot = Some(slot);
        self
    }
}

async fn run_isolate(args: &[String]) -> Result<std::process::Output, IsolateError> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| IsolateError::CommandFailed("empty command arguments".to_owned()))?;
    Command::new(program)
        .args(rest)
        .output()
        .await
        .map_err(IsolateError::SpawnFailed)
}

impl Drop for IsolateBox {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }

        warn!(
            box_id = self.id,
            box_path = %self.box_path.display(),
            "isolate box dropped without release, cleaning up in the background"
        );

        let args = IsolateCommand::new(&self.settings.isolate_path, self.id)
            .action(IsolateAction::Cleanup)
            .cgroup(self.settings.cgroup)
            .build();
        let id = self.id;
        let slot = self.slot.take();

        std::thread::spawn(move || {
            let Some((program, rest)) = args.split_first() else {
                return;
            };
            match std::process::Command::new(program).args(rest).output() {
                Ok(output) if output.status.success() => {
                    debug!(box_id = id, "background cleanup succeeded");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(box_id = id, stderr = %stderr, "background cleanup failed");
                }
                Err(e) => {
                    warn!(box_id = id, error = %e, "background cleanup spawn failed");
                }
            }
            drop(slot);
        });
    }
}

#[async_trait]
impl SandboxBox for IsolateBox {
    fn id(&self) -> u32 {
        self.id
    }

    #[instrument(skip(self, contents), fields(id = self.id, len = contents.len()))]
    async fn write_file(&self, name: &str, contents: &[u8]) -> Result<(), SandboxError> {
        let path = self.file_path(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        debug!(?path, "wrote file to box");
        Ok(())
    }

    async fn write_executable(&self, name: &str, contents: &[u8]) -> Result<(), SandboxError> {
        self.write_file(name, contents).await?;
        let path = self.file_path(name)?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(id = self.id))]
    async fn read_file(&self, name: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.file_path(name)?;
        let mut file = open_box_file(&path).await?.ok_or_else(|| {
            SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{name} not found in box"),
            ))
        })?;
        let mut content = Vec::new();
        file.read_to_end(&mut content).await?;
        debug!(?path, len = content.len(), "read file from box");
        Ok(content)
    }

    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn SandboxProcess>, SandboxError> {
        let process = IsolateProcess::spawn(self, request).await?;
        Ok(Box::new(process))
    }

    async fn release(&mut self) -> Result<(), SandboxError> {
        let result = self.cleanup().await;
        self.slot = None;
        result.map_err(SandboxError::from)
    }
}

/// Fixed set of isolate box IDs
///
/// A box ID is handed to one job at a time; the semaphore bounds how many
/// boxes exist at once.
#[derive(Debug)]
pub struct BoxPool {
    settings: Arc<IsolateSettings>,
    free: Arc<Mutex<Vec<u32>>>,
    semaphore: Arc<Semaphore>,
    count: u32,
}

impl BoxPool {
    /// `cgroup` is the effective setting after [`prepare_cgroup`](crate::isolate::prepare_cgroup)
    pub fn new(config: &Config, cgroup: bool) -> Self {
        let start = config.sandbox.first_box_id;
        let count = config.sandbox.pool_size;
        // Popped from the back, so the first acquire gets `start`
        let free = (start..start.saturating_add(count)).rev().collect::<Vec<_>>();

        Self {
            settings: Arc::new(IsolateSettings {
                isolate_path: config.isolate_binary(),
                cgroup,
                mounts: config.sandbox_mounts.clone(),
            }),
            semaphore: Arc::new(Semaphore::new(free.len())),
            free: Arc::new(Mutex::new(free)),
            count,
        }
    }

    #[instrument(skip(self))]
    pub async fn acquire_box(&self) -> Result<IsolateBox, IsolateError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| IsolateError::PoolClosed)?;

        let id = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(IsolateError::PoolClosed)?;
        let slot = BoxSlot {
            id,
            free: Arc::clone(&self.free),
            _permit: permit,
        };

        debug!(id, "acquired box from pool");

        let sandbox = IsolateBox::init(id, Arc::clone(&self.settings)).await?;
        Ok(sandbox.with_slot(slot))
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn cgroup(&self) -> bool {
        self.settings.cgroup
    }

    /// Stop handing out boxes; waiters get [`IsolateError::PoolClosed`]
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[async_trait]
impl Sandbox for BoxPool {
    async fn acquire(&self) -> Result<Box<dyn SandboxBox>, SandboxError> {
        Ok(Box::new(self.acquire_box().await?))
    }

    fn capacity(&self) -> usize {
        self.count as usize
    }
}
