use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded connection admission.
///
/// Admission is non-blocking: when every slot is taken the caller gets
/// `None` immediately and writes the protocol busy line itself, so a full
/// server still answers new connections promptly.
#[derive(Clone)]
pub struct ConnectionGate {
    slots: Arc<Semaphore>,
    max: usize,
    rejected: Arc<AtomicU64>,
}

/// Held for the lifetime of an admitted connection; dropping it frees the
/// slot.
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionGate {
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_connections)),
            max: max_connections,
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn try_admit(&self) -> Option<ConnectionPermit> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => Some(ConnectionPermit { _permit: permit }),
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn active(&self) -> usize {
        self.max - self.slots.available_permits()
    }

    /// Connections turned away since startup.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
