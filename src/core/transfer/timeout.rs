//! Timeout supervisor: one cancellable deadline per session key.
//!
//! Each arm gets a fresh generation number. When a timer fires, its callback
//! must [`TimeoutSupervisor::claim`] that generation before acting; a timer
//! that was rearmed or cleared in the meantime fails the claim and does
//! nothing. Callers arm and clear while holding the session's lock, and the
//! expiry callback claims under the same lock, which makes the terminal
//! side effect happen at most once per key.

use crate::core::peer::SessionKey;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TimeoutSupervisor {
    next_generation: AtomicU64,
    armed: Mutex<HashMap<SessionKey, ArmedTimer>>,
}

impl TimeoutSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, ArmedTimer>> {
        self.armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule `on_expire(generation)` after `after`, replacing and
    /// aborting any timer already armed for `key`.
    pub fn arm<F, Fut>(&self, key: SessionKey, after: Duration, on_expire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_expire(generation).await;
        });

        trace!(event = "timeout_armed", key = %key, generation, secs = after.as_secs(), "Timeout armed");
        if let Some(previous) = self.lock().insert(key, ArmedTimer { generation, handle }) {
            previous.handle.abort();
        }
        generation
    }

    /// Disarm `key`. Returns false if nothing was armed.
    pub fn clear(&self, key: &SessionKey) -> bool {
        match self.lock().remove(key) {
            Some(timer) => {
                timer.handle.abort();
                trace!(event = "timeout_cleared", key = %key, generation = timer.generation, "Timeout cleared");
                true
            }
            None => false,
        }
    }

    /// Called from a firing timer: take ownership of the expiry if
    /// `generation` is still the armed one.
    pub fn claim(&self, key: &SessionKey, generation: u64) -> bool {
        let mut armed = self.lock();
        match armed.get(key) {
            Some(timer) if timer.generation == generation => {
                armed.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, key: &SessionKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn armed_count(&self) -> usize {
        self.lock().len()
    }
}
