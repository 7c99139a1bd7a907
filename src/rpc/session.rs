use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::trace;

/// Fresh correlation id: millisecond timestamp plus 32 random bits, hex.
pub fn new_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let salt: u32 = rand::thread_rng().gen();
    format!("{millis:x}{salt:08x}")
}

/// In-flight calls awaiting an answer, keyed by session id.
///
/// Each entry resolves at most once. Entries are removed when answered and
/// when the caller gives up, so a late answer finds nothing and is dropped.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session id that is not currently in flight and listen on it.
    pub fn register(&self) -> (String, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());

        let mut session = new_session_id();
        while pending.contains_key(&session) {
            session = new_session_id();
        }
        pending.insert(session.clone(), tx);
        (session, rx)
    }

    /// Deliver an answer. Returns `false` if nobody is waiting for `session`.
    pub fn complete(&self, session: &str, data: Value) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session);

        match waiter {
            Some(tx) => tx.send(data).is_ok(),
            None => {
                trace!(session, "Dropping answer for unknown session");
                false
            }
        }
    }

    /// Forget a session whose caller stopped waiting.
    pub fn cancel(&self, session: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session);
    }

    /// Drop every waiter, resolving their receivers with an error.
    pub fn clear(&self) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_ids_differ() {
        let ids: std::collections::HashSet<_> = (0..200).map(|_| new_session_id()).collect();
        assert_eq!(ids.len(), 200);
    }

    #[tokio::test]
    async fn answers_reach_their_own_waiter() {
        let correlator = Correlator::new();
        let (a, rx_a) = correlator.register();
        let (b, rx_b) = correlator.register();
        assert_eq!(correlator.in_flight(), 2);

        assert!(correlator.complete(&b, json!("for b")));
        assert!(correlator.complete(&a, json!("for a")));

        assert_eq!(rx_a.await.unwrap(), json!("for a"));
        assert_eq!(rx_b.await.unwrap(), json!("for b"));
        assert_eq!(correlator.in_flight(), 0);
    }

    #[test]
    fn late_answers_are_dropped() {
        let correlator = Correlator::new();
        let (session, _rx) = correlator.register();
        correlator.cancel(&session);
        assert_eq!(correlator.in_flight(), 0);
        assert!(!correlator.complete(&session, json!(1)));
    }
}
