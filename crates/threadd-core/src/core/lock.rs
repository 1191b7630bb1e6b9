//! Per-thread conversation lock with FIFO waiters and an inbound message queue
//!
//! Exactly one holder per thread id. Waiters are served in arrival order and a
//! release hands ownership straight to the next live waiter. Messages that
//! arrive while a thread is busy are queued and drained by the holder once its
//! whole chained turn is finished.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::types::{now_millis, Channel};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// A message that arrived while its thread was locked
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub text: String,
    pub channel: Channel,
    pub actor: String,
    pub queued_at: i64,
}

/// Diagnostic view of a held lock
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub thread_id: String,
    pub holder: String,
    pub acquired_at: i64,
    pub held_for: Duration,
    pub waiters: usize,
}

struct Waiter {
    token: u64,
    holder: String,
    tx: oneshot::Sender<()>,
}

struct HeldLock {
    token: u64,
    holder: String,
    since: Instant,
    acquired_at: i64,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct LockState {
    next_token: u64,
    held: HashMap<String, HeldLock>,
    queues: HashMap<String, VecDeque<QueuedMessage>>,
}

impl LockState {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Release `token`'s hold on `thread_id`, handing off to the next waiter
    /// whose receiver is still alive. Returns false if `token` is not the holder.
    fn release(&mut self, thread_id: &str, token: u64) -> bool {
        let Some(lock) = self.held.get_mut(thread_id) else {
            return false;
        };
        if lock.token != token {
            return false;
        }

        while let Some(waiter) = lock.waiters.pop_front() {
            lock.token = waiter.token;
            lock.holder = waiter.holder;
            lock.since = Instant::now();
            lock.acquired_at = now_millis();
            if waiter.tx.send(()).is_ok() {
                debug!(thread_id = %thread_id, holder = %lock.holder, "Lock handed off");
                return true;
            }
        }

        self.held.remove(thread_id);
        debug!(thread_id = %thread_id, "Lock released");
        true
    }

    /// Clean up after a waiter that gave up: drop it from the queue, or if
    /// ownership already reached it, pass the lock on.
    fn abandon(&mut self, thread_id: &str, token: u64) {
        if let Some(lock) = self.held.get_mut(thread_id) {
            if let Some(pos) = lock.waiters.iter().position(|w| w.token == token) {
                lock.waiters.remove(pos);
                return;
            }
        }
        self.release(thread_id, token);
    }
}

/// Owned per orchestrator instance; cheap to clone
#[derive(Clone, Default)]
pub struct ConversationLocks {
    state: Arc<Mutex<LockState>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().expect("lock state mutex poisoned")
    }

    /// Wait for the lock, up to `timeout`.
    ///
    /// On timeout the caller never ends up holding the lock: if ownership was
    /// handed over during the race it is passed on before returning.
    pub async fn acquire(&self, thread_id: &str, holder: &str, timeout: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        let (token, rx) = {
            let mut state = self.state();
            let token = state.token();
            match state.held.get_mut(thread_id) {
                None => {
                    state.held.insert(
                        thread_id.to_string(),
                        HeldLock {
                            token,
                            holder: holder.to_string(),
                            since: Instant::now(),
                            acquired_at: now_millis(),
                            waiters: VecDeque::new(),
                        },
                    );
                    debug!(thread_id = %thread_id, holder = %holder, "Lock acquired");
                    return Ok(self.guard(thread_id, token));
                }
                Some(lock) => {
                    let (tx, rx) = oneshot::channel();
                    lock.waiters.push_back(Waiter {
                        token,
                        holder: holder.to_string(),
                        tx,
                    });
                    debug!(
                        thread_id = %thread_id,
                        holder = %holder,
                        current = %lock.holder,
                        position = lock.waiters.len(),
                        "Waiting for lock"
                    );
                    (token, rx)
                }
            }
        };

        let mut pending = PendingWait {
            state: Arc::clone(&self.state),
            thread_id: thread_id.to_string(),
            token,
            done: false,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                pending.done = true;
                debug!(
                    thread_id = %thread_id,
                    holder = %holder,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Lock acquired after wait"
                );
                Ok(self.guard(thread_id, token))
            }
            _ => {
                drop(pending);
                warn!(
                    thread_id = %thread_id,
                    holder = %holder,
                    timeout_ms = timeout.as_millis() as u64,
                    "Lock wait timed out"
                );
                Err(CoreError::LockTimeout {
                    thread_id: thread_id.to_string(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Take the lock only if it is free right now
    pub fn try_acquire(&self, thread_id: &str, holder: &str) -> Option<LockGuard> {
        let mut state = self.state();
        if state.held.contains_key(thread_id) {
            return None;
        }
        let token = state.token();
        state.held.insert(
            thread_id.to_string(),
            HeldLock {
                token,
                holder: holder.to_string(),
                since: Instant::now(),
                acquired_at: now_millis(),
                waiters: VecDeque::new(),
            },
        );
        drop(state);
        debug!(thread_id = %thread_id, holder = %holder, "Lock acquired");
        Some(self.guard(thread_id, token))
    }

    /// Take the lock if free, otherwise queue the message, as one step.
    /// `Err` carries the queue position.
    pub fn try_acquire_or_enqueue(
        &self,
        thread_id: &str,
        holder: &str,
        text: &str,
        channel: Channel,
        actor: &str,
    ) -> std::result::Result<LockGuard, usize> {
        let mut state = self.state();
        if state.held.contains_key(thread_id) {
            let queue = state.queues.entry(thread_id.to_string()).or_default();
            queue.push_back(QueuedMessage {
                text: text.to_string(),
                channel,
                actor: actor.to_string(),
                queued_at: now_millis(),
            });
            return Err(queue.len());
        }
        let token = state.token();
        state.held.insert(
            thread_id.to_string(),
            HeldLock {
                token,
                holder: holder.to_string(),
                since: Instant::now(),
                acquired_at: now_millis(),
                waiters: VecDeque::new(),
            },
        );
        Ok(self.guard(thread_id, token))
    }

    fn guard(&self, thread_id: &str, token: u64) -> LockGuard {
        LockGuard {
            state: Arc::clone(&self.state),
            thread_id: thread_id.to_string(),
            token,
            released: false,
        }
    }

    pub fn is_locked(&self, thread_id: &str) -> bool {
        self.state().held.contains_key(thread_id)
    }

    pub fn lock_info(&self, thread_id: &str) -> Option<LockInfo> {
        let state = self.state();
        state.held.get(thread_id).map(|lock| LockInfo {
            thread_id: thread_id.to_string(),
            holder: lock.holder.clone(),
            acquired_at: lock.acquired_at,
            held_for: lock.since.elapsed(),
            waiters: lock.waiters.len(),
        })
    }

    /// Emergency release regardless of holder. The next waiter, if any, gets the lock.
    pub fn force_release(&self, thread_id: &str) -> bool {
        let mut state = self.state();
        let Some((token, holder)) = state
            .held
            .get(thread_id)
            .map(|l| (l.token, l.holder.clone()))
        else {
            return false;
        };
        warn!(thread_id = %thread_id, holder = %holder, "Force-releasing lock");
        state.release(thread_id, token)
    }

    /// Queue a message for a busy thread. Returns its 1-based position.
    pub fn enqueue_message(&self, thread_id: &str, text: &str, channel: Channel, actor: &str) -> usize {
        let mut state = self.state();
        let queue = state.queues.entry(thread_id.to_string()).or_default();
        queue.push_back(QueuedMessage {
            text: text.to_string(),
            channel,
            actor: actor.to_string(),
            queued_at: now_millis(),
        });
        queue.len()
    }

    /// Take every queued message for a thread, oldest first
    pub fn drain_queue(&self, thread_id: &str) -> Vec<QueuedMessage> {
        self.state()
            .queues
            .remove(thread_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn queue_len(&self, thread_id: &str) -> usize {
        self.state().queues.get(thread_id).map_or(0, |q| q.len())
    }

    /// Put unprocessed messages back at the head of the queue, order preserved
    pub fn requeue_front(&self, thread_id: &str, messages: Vec<QueuedMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut state = self.state();
        let queue = state.queues.entry(thread_id.to_string()).or_default();
        for m in messages.into_iter().rev() {
            queue.push_front(m);
        }
    }
}

/// Cleans up a waiter whose `acquire` future timed out or was dropped
struct PendingWait {
    state: Arc<Mutex<LockState>>,
    thread_id: String,
    token: u64,
    done: bool,
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.abandon(&self.thread_id, self.token);
        }
    }
}

/// Held lock. Released on `release()` or drop, whichever comes first.
pub struct LockGuard {
    state: Arc<Mutex<LockState>>,
    thread_id: String,
    token: u64,
    released: bool,
}

impl LockGuard {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Ok(mut state) = self.state.lock() {
            state.release(&self.thread_id, self.token);
        }
    }

    /// Release only if no messages are queued for the thread; otherwise keep
    /// holding so the caller can drain them. Returns true once released.
    pub fn release_if_idle(&mut self) -> bool {
        if self.released {
            return true;
        }
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.queues.get(&self.thread_id).is_some_and(|q| !q.is_empty()) {
            return false;
        }
        state.release(&self.thread_id, self.token);
        self.released = true;
        true
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("thread_id", &self.thread_id)
            .field("released", &self.released)
            .finish()
    }
}
