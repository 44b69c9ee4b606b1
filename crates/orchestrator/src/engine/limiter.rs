//! Per-class admission limits.
//!
//! Each [`ActivityClass`] has its own pool. A repo activity waiting on a
//! workflow activity therefore never holds the token the workflow needs.

use std::sync::Arc;

use fso_core::LimitSettings;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityClass;
use crate::error::ActivityError;

/// Counting gate over concurrent runs of one class.
#[derive(Debug, Clone)]
pub struct Limiter {
    class: ActivityClass,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl Limiter {
    pub fn new(class: ActivityClass, capacity: usize) -> Self {
        Self {
            class,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn class(&self) -> ActivityClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a token, waiting until one is free or `cancel` fires.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ActivityError> {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ActivityError::Cancelled),
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| ActivityError::failed(format!("{} limiter closed", self.class)))
            }
        }
    }
}

/// The three limiter pools.
#[derive(Debug, Clone)]
pub struct Limiters {
    registry: Limiter,
    repo: Limiter,
    workflow: Limiter,
}

impl Limiters {
    pub fn from_settings(settings: &LimitSettings) -> Self {
        Self {
            registry: Limiter::new(ActivityClass::Registry, settings.registry),
            repo: Limiter::new(ActivityClass::Repo, settings.repo),
            workflow: Limiter::new(ActivityClass::Workflow, settings.workflow),
        }
    }

    pub fn get(&self, class: ActivityClass) -> &Limiter {
        match class {
            ActivityClass::Registry => &self.registry,
            ActivityClass::Repo => &self.repo,
            ActivityClass::Workflow => &self.workflow,
        }
    }
}
