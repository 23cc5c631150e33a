//! Registry of in-flight probe processes.

use parking_lot::Mutex;
use std::fmt;
use uuid::Uuid;

/// Opaque handle to a running probe process.
///
/// Two handles are equal when they refer to the same launch, regardless of
/// whether the operating system has reused the pid since.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    id: Uuid,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Handle for a freshly launched process.
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pid,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// OS process id, if the launcher knows it.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "probe {} (pid {})", self.id, pid),
            None => write!(f, "probe {}", self.id),
        }
    }
}

/// Active `(handle, port)` pairs.
///
/// Whoever removes a pair owns its cleanup: either the worker through a
/// successful [`ProcessRegistry::unregister`], or the shutdown path through
/// [`ProcessRegistry::drain`]. Never both.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    active: Mutex<Vec<(ProcessHandle, u16)>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a probe as active.
    pub fn register(&self, handle: ProcessHandle, port: u16) {
        self.active.lock().push((handle, port));
    }

    /// Remove the pair if it is still present.
    ///
    /// Returns `true` when this call removed it, meaning the caller now owns
    /// the port. `false` means the pair was already drained.
    pub fn unregister(&self, handle: &ProcessHandle, port: u16) -> bool {
        let mut active = self.active.lock();
        match active
            .iter()
            .position(|(h, p)| h == handle && *p == port)
        {
            Some(index) => {
                active.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Capture and clear every active pair in one critical section.
    pub fn drain(&self) -> Vec<(ProcessHandle, u16)> {
        std::mem::take(&mut *self.active.lock())
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}
