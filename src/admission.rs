//! Global admission control for inbound batches.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps how many batches the whole process works on at once.
///
/// Admission never waits: when every slot is taken the caller is turned
/// away immediately and is expected to answer "too many requests".
///
/// # Examples
///
/// ```rust
/// use url_fanout::AdmissionController;
///
/// let controller = AdmissionController::new(1);
/// let slot = controller.try_admit().expect("one slot is free");
/// assert!(controller.try_admit().is_none());
///
/// drop(slot);
/// assert!(controller.try_admit().is_some());
/// ```
#[derive(Debug)]
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Take a slot if one is free.
    ///
    /// The slot is released when the returned guard is dropped, on every
    /// exit path of the request that holds it.
    pub fn try_admit(&self) -> Option<AdmissionSlot> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                self.in_flight.fetch_add(1, Ordering::Relaxed);
                Some(AdmissionSlot {
                    _permit: permit,
                    in_flight: self.in_flight.clone(),
                })
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn admitted_total(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Share of slots currently held, in `[0.0, 1.0]`.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.in_flight() as f64 / self.capacity as f64
    }
}

/// Ownership of one admission slot.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
