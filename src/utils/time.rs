//! Wall-clock access for cookie timestamps.

use crate::error::{constants, ProtocolError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current timestamp in milliseconds
///
/// # Errors
/// Returns a `ProtocolError::Custom` if the system time is earlier than UNIX_EPOCH
pub fn current_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

/// Source of "now" for the dispatcher
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    /// Shared, manually advanced time in milliseconds
    Manual(Arc<AtomicU64>),
}

impl Clock {
    /// A manual clock starting at `start_ms`, plus the handle that drives it.
    pub fn manual(start_ms: u64) -> (Self, Arc<AtomicU64>) {
        let handle = Arc::new(AtomicU64::new(start_ms));
        (Self::Manual(handle.clone()), handle)
    }

    pub fn now_ms(&self) -> Result<u64> {
        match self {
            Self::System => current_timestamp(),
            Self::Manual(ms) => Ok(ms.load(Ordering::Relaxed)),
        }
    }
}
