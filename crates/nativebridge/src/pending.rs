//! Pending call table - outbound requests awaiting their terminal reply.
//!
//! Entries are keyed by correlation id and settled exactly once. DashMap
//! gives per-entry locking, so a reply racing a registration can't lose an
//! update.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::CallId;
use crate::error::CallError;

pub type CallOutcome = Result<Value, CallError>;

#[derive(Debug, thiserror::Error)]
pub enum PendingError {
    #[error("call id {0} is already pending")]
    DuplicateCallId(CallId),
}

/// Generates correlation ids for one side of the bridge.
///
/// `<prefix><n>` with `n` counting up from zero for the lifetime of the
/// generator. The prefix keeps our ids apart from the peer's.
#[derive(Debug)]
pub struct CallIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl CallIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> CallId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        CallId::new(format!("{}{}", self.prefix, n))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Future side of a pending entry.
///
/// Resolves with the settled outcome. If the table drops the entry without
/// settling it, resolves with `TransportClosed`.
#[derive(Debug)]
pub struct PendingCall {
    id: CallId,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    pub fn id(&self) -> &CallId {
        &self.id
    }
}

impl Future for PendingCall {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(CallError::TransportClosed)))
    }
}

/// Outstanding outbound calls.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: DashMap<CallId, oneshot::Sender<CallOutcome>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: CallId) -> Result<PendingCall, PendingError> {
        match self.calls.entry(id.clone()) {
            Entry::Occupied(_) => Err(PendingError::DuplicateCallId(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Ok(PendingCall { id, rx })
            }
        }
    }

    /// Remove and resolve the entry for `id`.
    ///
    /// Returns false for ids with no entry (duplicate reply, stale session,
    /// or protocol desync); those are logged and otherwise ignored.
    pub fn settle(&self, id: &CallId, outcome: CallOutcome) -> bool {
        match self.calls.remove(id) {
            Some((_, tx)) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!(call_id = %id, "Caller dropped before reply arrived");
                }
                true
            }
            None => {
                tracing::warn!(call_id = %id, "Discarding reply for unknown call id");
                false
            }
        }
    }

    /// Drop the entry for `id` without resolving it.
    pub fn forget(&self, id: &CallId) -> bool {
        self.calls.remove(id).is_some()
    }

    /// Settle every outstanding entry with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: CallError) -> usize {
        let ids: Vec<CallId> = self.calls.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.calls.remove(&id) {
                let _ = tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ErrorInfo;
    use serde_json::json;

    #[tokio::test]
    async fn register_and_settle() {
        let table = PendingCalls::new();
        let call = table.register(CallId::from("app0")).unwrap();
        assert_eq!(call.id().as_str(), "app0");
        assert!(table.contains(&CallId::from("app0")));

        assert!(table.settle(&CallId::from("app0"), Ok(json!("android"))));
        assert_eq!(call.await, Ok(json!("android")));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let table = PendingCalls::new();
        let _first = table.register(CallId::from("app0")).unwrap();
        let err = table.register(CallId::from("app0")).unwrap_err();
        assert!(matches!(err, PendingError::DuplicateCallId(id) if id.as_str() == "app0"));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn second_settle_is_a_noop() {
        let table = PendingCalls::new();
        let id = CallId::from("app1");
        let call = table.register(id.clone()).unwrap();

        assert!(table.settle(&id, Ok(json!(1))));
        assert!(!table.settle(&id, Ok(json!(2))));
        assert!(!table.settle(
            &id,
            Err(CallError::Remote(ErrorInfo::new("Late", "too late")))
        ));

        assert_eq!(call.await, Ok(json!(1)));
    }

    #[tokio::test]
    async fn unknown_id_leaves_other_entries_alone() {
        let table = PendingCalls::new();
        let _call = table.register(CallId::from("app0")).unwrap();

        assert!(!table.settle(&CallId::from("web9"), Ok(json!(null))));
        assert!(table.contains(&CallId::from("app0")));
    }

    #[tokio::test]
    async fn out_of_order_settlement_does_not_cross_talk() {
        let table = PendingCalls::new();
        let a = table.register(CallId::from("a")).unwrap();
        let b = table.register(CallId::from("b")).unwrap();

        table.settle(&CallId::from("b"), Ok(json!("for b")));
        assert_eq!(b.await, Ok(json!("for b")));

        table.settle(&CallId::from("a"), Ok(json!("for a")));
        assert_eq!(a.await, Ok(json!("for a")));
    }

    #[tokio::test]
    async fn fail_all_settles_everything() {
        let table = PendingCalls::new();
        let a = table.register(CallId::from("a")).unwrap();
        let b = table.register(CallId::from("b")).unwrap();

        assert_eq!(table.fail_all(CallError::TransportClosed), 2);
        assert!(table.is_empty());
        assert_eq!(a.await, Err(CallError::TransportClosed));
        assert_eq!(b.await, Err(CallError::TransportClosed));
    }

    #[tokio::test]
    async fn forgotten_call_resolves_closed() {
        let table = PendingCalls::new();
        let call = table.register(CallId::from("a")).unwrap();
        assert!(table.forget(&CallId::from("a")));
        assert!(!table.forget(&CallId::from("a")));
        assert_eq!(call.await, Err(CallError::TransportClosed));
    }

    #[tokio::test]
    async fn settle_after_caller_dropped_still_removes_entry() {
        let table = PendingCalls::new();
        drop(table.register(CallId::from("a")).unwrap());
        assert!(table.settle(&CallId::from("a"), Ok(json!(true))));
        assert!(table.is_empty());
    }

    #[test]
    fn id_generator_counts_up_with_prefix() {
        let ids = CallIdGenerator::new("app");
        assert_eq!(ids.prefix(), "app");
        assert_eq!(ids.next_id().as_str(), "app0");
        assert_eq!(ids.next_id().as_str(), "app1");
        assert_eq!(ids.next_id().as_str(), "app2");
    }

    #[test]
    fn id_generators_are_independent() {
        let ours = CallIdGenerator::new("app");
        let theirs = CallIdGenerator::new("web");
        assert_ne!(ours.next_id(), theirs.next_id());
        assert_eq!(ours.next_id().as_str(), "app1");
    }
}
