//! Peer readiness.
//!
//! A single replaceable one-shot signal. `init` settles the current signal;
//! `reload` swaps in a fresh one and bumps the epoch. Futures obtained before
//! a swap stay bound to their own signal: if it was never settled they never
//! resolve.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Waiting for the peer's `init`.
    NotReady,
    Ready,
}

struct ReadySignal {
    epoch: u64,
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    fn new(epoch: u64) -> Self {
        let (tx, _) = watch::channel(false);
        Self { epoch, tx }
    }
}

pub struct ReadyState {
    current: Mutex<ReadySignal>,
}

impl Default for ReadyState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyState {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(ReadySignal::new(0)),
        }
    }

    // The guarded value is replaced wholesale, so a poisoned lock still holds a valid signal.
    fn signal(&self) -> MutexGuard<'_, ReadySignal> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle the current signal. Returns false if it was already settled.
    pub fn mark_ready(&self) -> bool {
        let signal = self.signal();
        signal.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    /// Replace the signal with a fresh unsettled one. Returns the new epoch.
    pub fn reset(&self) -> u64 {
        let mut signal = self.signal();
        let epoch = signal.epoch + 1;
        *signal = ReadySignal::new(epoch);
        epoch
    }

    /// Future bound to the signal that is current right now.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.signal().tx.subscribe();
        async move {
            if rx.wait_for(|ready| *ready).await.is_err() {
                // Signal was replaced before it settled: abandoned, never resolves.
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn readiness(&self) -> Readiness {
        if *self.signal().tx.borrow() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    pub fn epoch(&self) -> u64 {
        self.signal().epoch
    }
}

impl std::fmt::Debug for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyState")
            .field("epoch", &self.epoch())
            .field("readiness", &self.readiness())
            .finish()
    }
}
