//! Public-port allocation for TCP and gRPC tunnels
//!
//! Allocation is a cyclic scan over the configured range: the cursor starts
//! at the beginning, wraps once, and skips ports the registry still holds.
//! Cycling avoids immediate reuse of just-released ports, which matters for
//! TCP TIME_WAIT. A client-requested port bypasses the cursor when it is
//! inside the range and free.

use crate::TunnelRegistry;
use std::sync::Mutex;
use thiserror::Error;

/// Allocation errors
#[derive(Debug, Error)]
pub enum PortAllocError {
    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("no available ports in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("port {0} is outside the configured range")]
    OutOfRange(u16),

    #[error("port {0} already in use")]
    PortUnavailable(u16),
}

/// Cyclic allocator over an inclusive port range.
pub struct PortAllocator {
    start: u16,
    end: u16,
    next: Mutex<u16>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Result<Self, PortAllocError> {
        if start == 0 || end < start {
            return Err(PortAllocError::InvalidRange { start, end });
        }
        Ok(Self {
            start,
            end,
            next: Mutex::new(start),
        })
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Resolve the public port for a tunnel request: honor an explicit
    /// in-range free port, otherwise scan from the cursor.
    pub fn claim(
        &self,
        requested: Option<u16>,
        registry: &TunnelRegistry,
    ) -> Result<u16, PortAllocError> {
        match requested {
            Some(port) => {
                if !(self.start..=self.end).contains(&port) {
                    return Err(PortAllocError::OutOfRange(port));
                }
                if registry.get_by_port(port).is_some() {
                    return Err(PortAllocError::PortUnavailable(port));
                }
                Ok(port)
            }
            None => self.allocate(registry),
        }
    }

    /// Scan up to one full cycle starting at the cursor, returning the
    /// first port the registry does not hold.
    pub fn allocate(&self, registry: &TunnelRegistry) -> Result<u16, PortAllocError> {
        let mut next = self.next.lock().unwrap();

        let range_size = u32::from(self.end) - u32::from(self.start) + 1;
        let offset = u32::from(*next) - u32::from(self.start);

        for i in 0..range_size {
            let candidate = self.start + ((offset + i) % range_size) as u16;
            if registry.get_by_port(candidate).is_none() {
                *next = if candidate == self.end {
                    self.start
                } else {
                    candidate + 1
                };
                return Ok(candidate);
            }
        }

        Err(PortAllocError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }
}
