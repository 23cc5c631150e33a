//! Bounded pool of reusable local ports for probe processes.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Highest valid TCP/UDP port.
const MAX_PORT: u32 = u16::MAX as u32;

/// Process-wide set of free probe ports.
///
/// The pool is filled once at construction and never synthesizes ports
/// afterwards. Each taken port must be given back exactly once; a second
/// give-back of the same port would let two workers share it. Prefer
/// [`PortPool::lease`], which makes the single return structural.
#[derive(Debug)]
pub struct PortPool {
    free: Mutex<Vec<u16>>,
    capacity: usize,
}

impl PortPool {
    /// Create a pool covering `[base_port, base_port + capacity - 1]`.
    ///
    /// The range is clamped to 65535. If even `base_port` is not a valid
    /// port the pool is empty. Both cases log a warning instead of failing.
    pub fn new(base_port: u32, capacity: usize) -> Self {
        let effective = effective_capacity(base_port, capacity);

        if effective == 0 && capacity > 0 {
            warn!(
                base_port,
                workers = capacity,
                "port range is outside 1-65535, port pool is empty"
            );
        } else if effective < capacity {
            warn!(
                base_port,
                workers = capacity,
                effective,
                "port range exceeds 65535, limiting pool size"
            );
        }

        // Fits in u16: effective > 0 implies base_port + effective - 1 <= 65535.
        let free: Vec<u16> = (0..effective)
            .map(|offset| (base_port as usize + offset) as u16)
            .collect();

        debug!(base_port, capacity = effective, "port pool initialized");

        Self {
            free: Mutex::new(free),
            capacity: effective,
        }
    }

    /// Take any free port, or `None` when the pool is exhausted.
    pub fn take(&self) -> Option<u16> {
        self.free.lock().pop()
    }

    /// Return a previously taken port to the pool.
    pub fn give_back(&self, port: u16) {
        let mut free = self.free.lock();
        debug_assert!(
            !free.contains(&port),
            "port {port} returned to the pool twice"
        );
        free.push(port);
    }

    /// Take a port wrapped in a guard that gives it back when dropped.
    pub fn lease(self: &Arc<Self>) -> Option<PortLease> {
        self.take().map(|port| PortLease {
            pool: Arc::clone(self),
            port: Some(port),
        })
    }

    /// Number of ports the pool was populated with (after clamping).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of ports currently free.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

fn effective_capacity(base_port: u32, capacity: usize) -> usize {
    if base_port == 0 || base_port > MAX_PORT {
        return 0;
    }
    let room = (MAX_PORT - base_port + 1) as usize;
    capacity.min(room)
}

/// Scoped ownership of one pool port.
///
/// The port goes back to the pool exactly once: on drop, unless ownership
/// was moved out with [`PortLease::into_port`].
#[derive(Debug)]
pub struct PortLease {
    pool: Arc<PortPool>,
    port: Option<u16>,
}

impl PortLease {
    /// The leased port.
    pub fn port(&self) -> u16 {
        // Only `into_port` clears the slot, and it consumes the lease.
        self.port.unwrap_or_default()
    }

    /// Release the port from the lease without returning it to the pool.
    ///
    /// The caller becomes responsible for the single give-back, typically by
    /// handing the port to the process registry.
    pub fn into_port(mut self) -> u16 {
        self.port.take().unwrap_or_default()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            self.pool.give_back(port);
        }
    }
}
