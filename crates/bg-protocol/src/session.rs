//! Session identifier type

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sequential, human-readable identifier of one agent connection.
///
/// Rendered as `#00000`, `#00001`, ... in logs and listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

impl SessionId {
    /// Create a session ID with an explicit value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate the next process-wide session ID
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:05}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId::new(0).to_string(), "#00000");
        assert_eq!(SessionId::new(42).to_string(), "#00042");
        assert_eq!(SessionId::new(123456).to_string(), "#123456");
    }

    #[test]
    fn test_session_id_next_is_increasing() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(b > a);
    }
}
