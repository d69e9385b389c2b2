//! Callback correlation for asynchronous control-plane requests
//!
//! Every outgoing request stamps a uuid and registers a callback here;
//! the matching response (or the expiry sweep, or the socket-close path)
//! consumes the entry and invokes the callback exactly once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::api::{ErrorCode, EventMessage};

/// Default deadline for a registered callback.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed outcome of a request, handed to the registered callback.
#[derive(Debug, Clone)]
pub struct CallbackResult {
    /// 0 on success, otherwise the response's error code
    pub code: u32,
    /// Error description, empty on success
    pub description: String,
    /// Response payload, if the event carries one
    pub response: Option<Value>,
}

impl CallbackResult {
    pub fn success(response: Option<Value>) -> Self {
        Self {
            code: 0,
            description: String::new(),
            response,
        }
    }

    pub fn failure(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            description: code.description().to_string(),
            response: None,
        }
    }

    /// Extract the result of a response message.
    pub fn from_message(msg: &EventMessage) -> Self {
        Self {
            code: msg.result_code(),
            description: msg
                .result_description()
                .map(str::to_string)
                .unwrap_or_default(),
            response: msg.response.clone(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// A callback waiting for its response.
pub type Callback = Box<dyn FnOnce(CallbackResult) + Send>;

struct Entry {
    deadline: Instant,
    callback: Callback,
}

/// Uuid-indexed registry of pending request callbacks with absolute
/// deadlines. Owned by a single task; expiry runs from that task's
/// periodic sweep timer.
pub struct CallbackRegistry {
    entries: HashMap<Uuid, Entry>,
    default_ttl: Duration,
}

impl CallbackRegistry {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
        }
    }

    /// Register `callback` under `uuid` with the default deadline.
    pub fn register(&mut self, uuid: Uuid, callback: Callback) {
        self.register_with_ttl(uuid, self.default_ttl, callback);
    }

    /// Register `callback` under `uuid`, expiring after `ttl`.
    pub fn register_with_ttl(&mut self, uuid: Uuid, ttl: Duration, callback: Callback) {
        let deadline = Instant::now() + ttl;
        self.entries.insert(uuid, Entry { deadline, callback });
    }

    /// Remove and return the callback registered under `uuid`.
    pub fn unregister(&mut self, uuid: &Uuid) -> Option<Callback> {
        self.entries.remove(uuid).map(|e| e.callback)
    }

    /// Reclaim entries whose deadline has passed, notifying each with a
    /// timeout code. Returns the number of expired entries.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(uuid, _)| *uuid)
            .collect();

        for uuid in &expired {
            if let Some(entry) = self.entries.remove(uuid) {
                debug!(%uuid, "request timed out");
                (entry.callback)(CallbackResult::failure(ErrorCode::Timeout));
            }
        }

        expired.len()
    }

    /// Drain every pending entry, notifying each with `code`. Used on the
    /// socket-close path so each callback still fires exactly once when
    /// the peer disappears.
    pub fn fail_all(&mut self, code: ErrorCode) -> usize {
        let n = self.entries.len();
        for (_, entry) in self.entries.drain() {
            (entry.callback)(CallbackResult::failure(code));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_response_consumes_entry_once() {
        let mut registry = CallbackRegistry::new(DEFAULT_REQUEST_TIMEOUT);
        let hits = Arc::new(AtomicU32::new(0));
        let uuid = Uuid::new_v4();

        let h = hits.clone();
        registry.register(
            uuid,
            Box::new(move |result| {
                assert!(result.is_ok());
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let cb = registry.unregister(&uuid).expect("entry present");
        cb(CallbackResult::success(None));

        assert!(registry.unregister(&uuid).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expiry_notifies_with_timeout_code() {
        let mut registry = CallbackRegistry::new(Duration::from_millis(0));
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        registry.register(
            Uuid::new_v4(),
            Box::new(move |result| {
                assert_eq!(result.code, ErrorCode::Timeout.code());
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let expired = registry.expire(Instant::now() + Duration::from_millis(1));
        assert_eq!(expired, 1);
        assert!(registry.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unexpired_entries_survive_sweep() {
        let mut registry = CallbackRegistry::new(Duration::from_secs(60));
        registry.register(Uuid::new_v4(), Box::new(|_| panic!("must not fire")));
        assert_eq!(registry.expire(Instant::now()), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_fail_all_drains() {
        let mut registry = CallbackRegistry::new(DEFAULT_REQUEST_TIMEOUT);
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            registry.register(
                Uuid::new_v4(),
                Box::new(move |result| {
                    assert_eq!(result.code, ErrorCode::ProcessingError.code());
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(registry.fail_all(ErrorCode::ProcessingError), 3);
        assert!(registry.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
