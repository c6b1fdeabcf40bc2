//! Local port allocation for preview processes.
//!
//! A port is handed out when nothing is bound to it and no recent
//! reservation holds it. Reservations cover the gap between allocation and
//! the process binding the port; after [`RESERVATION_TTL`] the bind check
//! alone decides.

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{AppError, Result};

/// Lifetime of an unreleased reservation.
pub const RESERVATION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Reservation {
    workspace_id: String,
    at: Instant,
}

/// Hands out ports from an inclusive range.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    reserved: Mutex<HashMap<u16, Reservation>>,
}

impl PortAllocator {
    /// Create an allocator over `start..=end`.
    #[must_use]
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    /// Configured range as `(start, end)`.
    #[must_use]
    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Reserve the first free port for `workspace_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StartFailed` if every port in the range is taken.
    pub fn allocate(&self, workspace_id: &str) -> Result<u16> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| AppError::StartFailed("port table poisoned".into()))?;
        let now = Instant::now();
        reserved.retain(|_, r| now.duration_since(r.at) < RESERVATION_TTL);

        for port in self.start..=self.end {
            if reserved.contains_key(&port) || !is_bindable(port) {
                continue;
            }
            reserved.insert(
                port,
                Reservation {
                    workspace_id: workspace_id.to_owned(),
                    at: now,
                },
            );
            debug!(workspace_id, port, "port reserved");
            return Ok(port);
        }

        Err(AppError::StartFailed(format!(
            "no free port in range {}-{}",
            self.start, self.end
        )))
    }

    /// Drop the reservation for `port`, if any.
    pub fn release(&self, port: u16) {
        if let Ok(mut reserved) = self.reserved.lock() {
            if let Some(r) = reserved.remove(&port) {
                debug!(workspace_id = r.workspace_id, port, "port released");
            }
        }
    }

    /// Number of unexpired reservations.
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().map_or(0, |reserved| {
            let now = Instant::now();
            reserved
                .values()
                .filter(|r| now.duration_since(r.at) < RESERVATION_TTL)
                .count()
        })
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
