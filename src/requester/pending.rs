//! In-flight request table keyed by message id.
//!
//! Each call owns a oneshot receiver; the first terminal signal for an id
//! removes its entry and consumes the sender, so a second signal for the
//! same id finds nothing to settle.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::codec::Outcome;
use crate::error::TemitError;

/// Terminal signal for a pending call.
#[derive(Debug)]
pub(crate) enum Settlement {
    /// The endpoint replied.
    Reply(Outcome),
    /// The broker returned the request as unroutable.
    Returned,
    /// The reply path died before anything else happened.
    Failed(TemitError),
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: DashMap<String, oneshot::Sender<Settlement>>,
}

/// A registered call. Dropping it deregisters the id, whether or not it
/// was ever settled.
pub(crate) struct PendingCall {
    id: String,
    calls: Arc<PendingCalls>,
    rx: oneshot::Receiver<Settlement>,
}

impl PendingCalls {
    /// Register `id` and get the handle to await its settlement.
    pub fn register(self: &Arc<Self>, id: &str) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id.to_string(), tx);
        PendingCall {
            id: id.to_string(),
            calls: Arc::clone(self),
            rx,
        }
    }

    /// Deliver the terminal signal for `id`.
    ///
    /// Returns false if nothing is waiting on it any more (timed out,
    /// already settled, or never ours).
    pub fn settle(&self, id: &str, settlement: Settlement) -> bool {
        match self.calls.remove(id) {
            Some((_, tx)) => tx.send(settlement).is_ok(),
            None => false,
        }
    }

    /// Settle every waiting call with `error`.
    pub fn fail_all(&self, error: TemitError) {
        let ids: Vec<String> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.settle(&id, Settlement::Failed(error.clone()));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.calls.contains_key(id)
    }
}

impl PendingCall {
    /// Wait for the first terminal signal.
    pub async fn settled(&mut self) -> Settlement {
        match (&mut self.rx).await {
            Ok(settlement) => settlement,
            Err(_) => Settlement::Failed(TemitError::Transport(
                "reply dispatcher dropped the call".to_string(),
            )),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.calls.calls.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reply_settles_call() {
        let calls = Arc::new(PendingCalls::default());
        let mut call = calls.register("m1");

        let poster = {
            let calls = calls.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                calls.settle("m1", Settlement::Reply(Ok(json!("hi"))))
            })
        };

        match call.settled().await {
            Settlement::Reply(Ok(value)) => assert_eq!(value, json!("hi")),
            other => panic!("unexpected settlement: {:?}", other),
        }
        assert!(poster.await.unwrap());
        assert!(!calls.contains("m1"));
    }

    #[tokio::test]
    async fn test_only_first_signal_settles() {
        let calls = Arc::new(PendingCalls::default());
        let mut call = calls.register("m1");

        assert!(calls.settle("m1", Settlement::Returned));
        assert!(!calls.settle("m1", Settlement::Reply(Ok(json!(1)))));
        assert!(matches!(call.settled().await, Settlement::Returned));
    }

    #[tokio::test]
    async fn test_timeout_deregisters_and_late_reply_is_ignored() {
        let calls = Arc::new(PendingCalls::default());
        let mut call = calls.register("m1");

        let waited = tokio::time::timeout(Duration::from_millis(50), call.settled()).await;
        assert!(waited.is_err());
        drop(call);

        assert_eq!(calls.len(), 0);
        assert!(!calls.settle("m1", Settlement::Reply(Ok(json!(1)))));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let calls = Arc::new(PendingCalls::default());
        let mut a = calls.register("a");
        let mut b = calls.register("b");

        calls.fail_all(TemitError::Closed);

        assert!(matches!(a.settled().await, Settlement::Failed(TemitError::Closed)));
        assert!(matches!(b.settled().await, Settlement::Failed(TemitError::Closed)));
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn test_unknown_id_is_not_settled() {
        let calls = PendingCalls::default();
        assert!(!calls.settle("nobody", Settlement::Returned));
    }
}
