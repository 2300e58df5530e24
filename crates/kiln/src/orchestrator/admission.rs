//! Admission control
//!
//! A job needs a running slot (global) and a caller slot (per client).
//! When no running slot is free it waits in a bounded queue for at most
//! `queue_timeout`. Every slot is a guard released on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::AdmissionConfig;

/// Why a job was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Busy {
    #[error("caller already has the maximum number of jobs in flight")]
    CallerLimit,

    #[error("job queue is full")]
    QueueFull,

    #[error("timed out waiting for a job slot")]
    QueueTimeout,

    #[error("admission is closed")]
    Closed,
}

impl Busy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Busy::CallerLimit => "caller_limit",
            Busy::QueueFull => "queue_full",
            Busy::QueueTimeout => "queue_timeout",
            Busy::Closed => "closed",
        }
    }
}

type CallerCounts = Arc<Mutex<HashMap<String, usize>>>;

#[derive(Debug)]
pub struct Admission {
    running: Arc<Semaphore>,
    max_running: usize,
    queued: Arc<AtomicUsize>,
    max_queued: usize,
    callers: CallerCounts,
    max_per_caller: usize,
    queue_timeout: Duration,
}

/// Held for the lifetime of an admitted job
#[derive(Debug)]
pub struct AdmissionPermit {
    _running: OwnedSemaphorePermit,
    _caller: CallerSlot,
}

#[derive(Debug)]
struct CallerSlot {
    caller: String,
    callers: CallerCounts,
}

impl Drop for CallerSlot {
    fn drop(&mut self) {
        let mut callers = self.callers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = callers.get_mut(&self.caller) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                callers.remove(&self.caller);
            }
        }
    }
}

struct QueueSlot(Arc<AtomicUsize>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Admission {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            running: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            max_running: config.max_concurrent_jobs,
            queued: Arc::new(AtomicUsize::new(0)),
            max_queued: config.max_queued_jobs,
            callers: Arc::new(Mutex::new(HashMap::new())),
            max_per_caller: config.max_jobs_per_caller,
            queue_timeout: config.queue_timeout(),
        }
    }

    /// Admit one job for `caller`, waiting in the queue if needed
    pub async fn admit(&self, caller: &str) -> Result<AdmissionPermit, Busy> {
        let caller_slot = self.claim_caller(caller)?;

        if let Ok(permit) = Arc::clone(&self.running).try_acquire_owned() {
            return Ok(AdmissionPermit {
                _running: permit,
                _caller: caller_slot,
            });
        }

        let queue_slot = self.enqueue()?;
        debug!(caller, queued = self.queued(), "waiting for a job slot");

        let acquired =
            tokio::time::timeout(self.queue_timeout, Arc::clone(&self.running).acquire_owned())
                .await;
        drop(queue_slot);

        match acquired {
            Ok(Ok(permit)) => Ok(AdmissionPermit {
                _running: permit,
                _caller: caller_slot,
            }),
            Ok(Err(_)) => Err(Busy::Closed),
            Err(_) => Err(Busy::QueueTimeout),
        }
    }

    fn claim_caller(&self, caller: &str) -> Result<CallerSlot, Busy> {
        let mut callers = self.callers.lock().unwrap_or_else(PoisonError::into_inner);
        let count = callers.entry(caller.to_owned()).or_insert(0);
        if *count >= self.max_per_caller {
            return Err(Busy::CallerLimit);
        }
        *count += 1;
        Ok(CallerSlot {
            caller: caller.to_owned(),
            callers: Arc::clone(&self.callers),
        })
    }

    fn enqueue(&self) -> Result<QueueSlot, Busy> {
        let max = self.max_queued;
        self.queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map_err(|_| Busy::QueueFull)?;
        Ok(QueueSlot(Arc::clone(&self.queued)))
    }

    /// Jobs holding a running slot
    pub fn running(&self) -> usize {
        self.max_running - self.running.available_permits()
    }

    /// Jobs waiting for a running slot
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Jobs in flight for `caller`, queued ones included
    pub fn caller_jobs(&self, caller: &str) -> usize {
        self.callers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(caller)
            .copied()
            .unwrap_or(0)
    }

    /// Refuse new jobs and wake queued ones
    pub fn close(&self) {
        self.running.close();
    }
}
