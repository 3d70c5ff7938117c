use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::GateError;

/// Counting gate serializing access to a scarce shared resource, typically a
/// single accelerator shared by many concurrently submitted tasks.
///
/// One gate instance is created per run and shared by reference (cheap clone)
/// across every task that declares a need for the resource; tasks without
/// that need never touch it. With the observed capacity of 1 the gate is an
/// exclusive lock, but any permit count works.
///
/// Release is not a method. A successful [`ResourceGate::acquire`] returns a
/// [`GatePermit`] whose `Drop` returns the permit, so the protected section
/// cannot leak a permit on any exit path, early returns and failures
/// included.
#[derive(Debug, Clone)]
pub struct ResourceGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl ResourceGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// A gate with a single permit, the configuration observed in practice.
    pub fn exclusive() -> Self {
        Self::new(1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits until a permit is available. No fairness guarantee beyond
    /// eventual admission once a permit is released.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let permit = Arc::clone(&self.permits).acquire_owned().await?;
        Ok(GatePermit { _permit: permit })
    }

    /// Takes a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        Some(GatePermit { _permit: permit })
    }
}

/// Held for the duration of a protected section; the permit returns to the
/// gate when this guard is dropped.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}
