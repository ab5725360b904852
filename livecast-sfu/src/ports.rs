//! Bounded RTC port range
//!
//! Every transport holds a [`PortLease`] for its lifetime. Dropping the lease
//! returns the port to the pool.

use crate::error::SfuError;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

struct PortPool {
    in_use: BTreeSet<u16>,
    /// Next port to try, so freed ports are not handed out again immediately
    cursor: u16,
}

/// Allocator over `min..=max`
pub struct PortAllocator {
    min: u16,
    max: u16,
    pool: Arc<Mutex<PortPool>>,
}

impl PortAllocator {
    /// An inverted range is normalized by swapping the bounds.
    #[must_use]
    pub fn new(min: u16, max: u16) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            pool: Arc::new(Mutex::new(PortPool {
                in_use: BTreeSet::new(),
                cursor: min,
            })),
        }
    }

    /// Lease a free port. Exhaustion is retryable.
    pub fn acquire(&self) -> Result<PortLease, SfuError> {
        let mut pool = self.pool.lock();
        let capacity = u32::from(self.max - self.min) + 1;

        let mut candidate = pool.cursor;
        for _ in 0..capacity {
            if !pool.in_use.contains(&candidate) {
                pool.in_use.insert(candidate);
                pool.cursor = if candidate == self.max { self.min } else { candidate + 1 };
                return Ok(PortLease {
                    port: candidate,
                    pool: Arc::clone(&self.pool),
                });
            }
            candidate = if candidate == self.max { self.min } else { candidate + 1 };
        }

        warn!(
            min_port = self.min,
            max_port = self.max,
            "RTC port range exhausted"
        );
        Err(SfuError::PortsExhausted {
            min: self.min,
            max: self.max,
        })
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.pool.lock().in_use.len()
    }

    #[must_use]
    pub const fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }
}

/// A leased port, released on drop
pub struct PortLease {
    port: u16,
    pool: Arc<Mutex<PortPool>>,
}

impl PortLease {
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.lock().in_use.remove(&self.port);
    }
}
