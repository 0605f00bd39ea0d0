//! Bounded VM pool
//!
//! Isolates are not `Send`, so spare VMs live in thread-local free lists
//! and never migrate between threads; a global semaphore enforces the hard
//! cap on in-flight VMs and a global counter enforces the soft cap on
//! retained spares. A lease returns its VM on drop: reset and kept when
//! below the spare cap, closed otherwise. A VM that fails to reset is
//! always closed.

use crate::error::SsrError;
use crate::vm::Vm;
use serde::Deserialize;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

thread_local! {
    // Vec is LIFO on purpose: V8 isolates must be dropped in reverse
    // creation order within a thread.
    static SPARE_VMS: RefCell<Vec<Vm>> = const { RefCell::new(Vec::new()) };
}

/// Pool sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct VmPoolConfig {
    /// Hard cap on simultaneously checked-out VMs; acquirers block when
    /// the pool is saturated.
    #[serde(default = "default_max_vms")]
    pub max_vms: usize,
    /// Soft cap on idle VMs retained across requests.
    #[serde(default = "default_max_spare_vms")]
    pub max_spare_vms: usize,
}

fn default_max_vms() -> usize {
    4
}

fn default_max_spare_vms() -> usize {
    2
}

impl Default for VmPoolConfig {
    fn default() -> Self {
        Self {
            max_vms: default_max_vms(),
            max_spare_vms: default_max_spare_vms(),
        }
    }
}

/// Bounded pool handing out exclusive VM leases.
#[derive(Clone)]
pub struct VmPool {
    semaphore: Arc<Semaphore>,
    spare_count: Arc<AtomicUsize>,
    max_vms: usize,
    max_spare: usize,
}

impl VmPool {
    /// Creates a pool with the given caps. A zero `max_vms` is clamped
    /// to one.
    pub fn new(config: &VmPoolConfig) -> Self {
        let max_vms = config.max_vms.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_vms)),
            spare_count: Arc::new(AtomicUsize::new(0)),
            max_vms,
            max_spare: config.max_spare_vms,
        }
    }

    /// Checks out a VM, blocking while the pool is saturated. Reuses a
    /// spare from this thread's free list when one is available.
    pub async fn get(&self) -> Result<VmLease, SsrError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| SsrError::Config("VM pool is closed".to_string()))?;

        let vm = self.take_spare().unwrap_or_default();
        Ok(VmLease {
            vm: Some(vm),
            _permit: permit,
            spare_count: Arc::clone(&self.spare_count),
            max_spare: self.max_spare,
        })
    }

    /// Hard cap on in-flight VMs.
    pub fn capacity(&self) -> usize {
        self.max_vms
    }

    /// Number of VM slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Idle VMs currently retained across all threads.
    pub fn spares(&self) -> usize {
        self.spare_count.load(Ordering::SeqCst)
    }

    fn take_spare(&self) -> Option<Vm> {
        let vm = SPARE_VMS.with(|cell| cell.borrow_mut().pop());
        if vm.is_some() {
            self.spare_count.fetch_sub(1, Ordering::SeqCst);
        }
        vm
    }
}

/// Exclusive checkout of one VM; returns it to the pool on drop.
pub struct VmLease {
    vm: Option<Vm>,
    _permit: OwnedSemaphorePermit,
    spare_count: Arc<AtomicUsize>,
    max_spare: usize,
}

impl Deref for VmLease {
    type Target = Vm;

    fn deref(&self) -> &Vm {
        self.vm.as_ref().expect("VM already returned")
    }
}

impl DerefMut for VmLease {
    fn deref_mut(&mut self) -> &mut Vm {
        self.vm.as_mut().expect("VM already returned")
    }
}

impl Drop for VmLease {
    fn drop(&mut self) {
        let Some(mut vm) = self.vm.take() else {
            return;
        };
        if vm.reset().is_err() {
            vm.close();
            return;
        }
        let kept = self
            .spare_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_spare).then_some(n + 1)
            })
            .is_ok();
        if kept {
            SPARE_VMS.with(|cell| cell.borrow_mut().push(vm));
        } else {
            vm.close();
        }
        // The permit drops with the lease, freeing the slot.
    }
}
