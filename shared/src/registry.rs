//! Correlation registry.
//!
//! Tracks every forwarded call that is waiting for its response frame. The
//! caller that forwards a request holds a [`CallHandle`]; the task reading
//! the tunnel calls [`CorrelationRegistry::resolve`] when the matching
//! response arrives, which wakes exactly that caller.
//!
//! Entries are keyed by `(SessionId, CorrelationId)`. The map shards are the
//! table-level lock and are never held across an await; each entry carries
//! its own oneshot, so waiters on different keys never contend.
//!
//! A `CallHandle` removes its entry when dropped. `wait` consumes the handle,
//! so the entry is gone on every exit path: response, timeout, cancellation,
//! eviction, or the caller's future being dropped mid-flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{CorrelationId, ForwardRequest, ForwardResponse};
use crate::session::SessionId;
use crate::{Error, Result};

type Key = (SessionId, CorrelationId);

/// What `register` does when the key already has a call in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Fail the second registration with `DuplicateInFlight`.
    #[default]
    Reject,
    /// Queue the second registration until the first call is released.
    /// Calls on one key then run one at a time, in registration order.
    Serialize,
}

/// Completion state of a registered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Resolved,
    Failed,
    TimedOut,
}

enum Outcome {
    Resolved(ForwardResponse),
    Failed(Error),
}

struct PendingCall {
    generation: u64,
    state: CallState,
    request: Arc<ForwardRequest>,
    reply: Option<oneshot::Sender<Outcome>>,
    registered_at: Instant,
}

impl PendingCall {
    /// Wake the waiter with `error` if nobody answered yet.
    fn fail(&mut self, error: Error) {
        if self.state != CallState::Pending {
            return;
        }
        self.state = CallState::Failed;
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Outcome::Failed(error));
        }
    }
}

struct QueuedCall {
    call: PendingCall,
    turn: oneshot::Sender<()>,
}

/// One key's active call plus, under `Serialize`, the calls queued behind it.
struct Slot {
    active: PendingCall,
    queue: VecDeque<QueuedCall>,
}

#[derive(Clone)]
pub struct CorrelationRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    slots: DashMap<Key, Slot>,
    policy: DuplicatePolicy,
    generation: AtomicU64,
    shut_down: AtomicBool,
}

impl CorrelationRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: DashMap::new(),
                policy,
                generation: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Register a call on `session` keyed by the request's correlation id.
    ///
    /// Under [`DuplicatePolicy::Serialize`] this waits for earlier calls on
    /// the same key; callers bound that wait themselves.
    pub async fn register(&self, session: SessionId, request: ForwardRequest) -> Result<CallHandle> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let request = Arc::new(request);
        let key = (session, request.uuid.clone());
        let (reply_tx, reply_rx) = oneshot::channel();
        let call = PendingCall {
            generation,
            state: CallState::Pending,
            request: request.clone(),
            reply: Some(reply_tx),
            registered_at: Instant::now(),
        };

        let turn = match self.inner.slots.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    active: call,
                    queue: VecDeque::new(),
                });
                None
            }
            Entry::Occupied(mut occupied) => match self.inner.policy {
                DuplicatePolicy::Reject => return Err(Error::DuplicateInFlight(key.1)),
                DuplicatePolicy::Serialize => {
                    let (turn_tx, turn_rx) = oneshot::channel();
                    occupied.get_mut().queue.push_back(QueuedCall { call, turn: turn_tx });
                    Some(turn_rx)
                }
            },
        };

        // From here on the handle owns the entry and releases it on drop.
        let handle = CallHandle {
            registry: self.clone(),
            key,
            generation,
            request,
            reply: reply_rx,
        };

        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }

        if let Some(turn) = turn {
            debug!(session = %session, id = %handle.key.1, "call queued behind in-flight call");
            if turn.await.is_err() {
                return Err(Error::SessionClosed(session));
            }
        }

        debug!(session = %session, id = %handle.key.1, "call registered");
        Ok(handle)
    }

    /// Deliver a response frame to the call waiting for it.
    ///
    /// Returns `false`, without side effects, when no pending call matches
    /// the id and sequence number: the caller already timed out, was
    /// cancelled, or never existed.
    pub fn resolve(&self, session: SessionId, response: ForwardResponse) -> bool {
        let key = (session, response.uuid.clone());
        let Some(mut slot) = self.inner.slots.get_mut(&key) else {
            debug!(session = %session, id = %key.1, "response for unknown call dropped");
            return false;
        };

        let call = &mut slot.active;
        if call.state != CallState::Pending {
            warn!(session = %session, id = %key.1, state = ?call.state, "late response dropped");
            return false;
        }
        // Serialized calls share an id; the sequence number tells them apart.
        if response.seq_no != call.request.seq_no {
            warn!(
                session = %session,
                id = %key.1,
                expected = call.request.seq_no,
                got = response.seq_no,
                "response for an earlier call dropped"
            );
            return false;
        }

        call.state = CallState::Resolved;
        match call.reply.take() {
            Some(reply) => reply.send(Outcome::Resolved(response)).is_ok(),
            None => false,
        }
    }

    /// Fail every call scoped to `session` and drop their entries.
    /// Returns how many callers were woken.
    pub fn evict_session(&self, session: SessionId) -> usize {
        let mut failed = 0;
        self.inner.slots.retain(|(sid, _), slot| {
            if *sid != session {
                return true;
            }
            slot.active.fail(Error::SessionClosed(session));
            failed += 1;
            // Dropping the turn senders wakes queued registrations with an error.
            failed += slot.queue.drain(..).count();
            false
        });

        if failed > 0 {
            debug!(session = %session, failed, "evicted pending calls");
        }
        failed
    }

    /// Fail everything and refuse further registrations.
    pub fn shutdown(&self) -> usize {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let mut failed = 0;
        self.inner.slots.retain(|_, slot| {
            slot.active.fail(Error::Shutdown);
            failed += 1 + slot.queue.drain(..).count();
            false
        });
        failed
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Number of keys with a call in flight.
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    pub fn contains(&self, session: SessionId, id: &CorrelationId) -> bool {
        self.inner.slots.contains_key(&(session, id.clone()))
    }

    /// Calls in flight or queued on one session.
    pub fn pending_for(&self, session: SessionId) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.key().0 == session)
            .map(|slot| 1 + slot.queue.len())
            .sum()
    }

    fn mark(&self, key: &Key, generation: u64, state: CallState) {
        if let Some(mut slot) = self.inner.slots.get_mut(key) {
            if slot.active.generation == generation && slot.active.state == CallState::Pending {
                slot.active.state = state;
                slot.active.reply = None;
            }
        }
    }

    /// Drop the entry for `generation`, handing the key to the next queued
    /// registration if there is one.
    fn release(&self, key: &Key, generation: u64) {
        let mut next_turn = None;
        self.inner.slots.remove_if_mut(key, |_, slot| {
            if slot.active.generation != generation {
                slot.queue.retain(|queued| queued.call.generation != generation);
                return false;
            }
            debug!(
                session = %key.0,
                id = %key.1,
                state = ?slot.active.state,
                held_ms = slot.active.registered_at.elapsed().as_millis() as u64,
                "call released"
            );
            while let Some(queued) = slot.queue.pop_front() {
                // A closed turn means that registration was abandoned.
                if queued.turn.is_closed() {
                    continue;
                }
                slot.active = queued.call;
                next_turn = Some(queued.turn);
                return false;
            }
            true
        });

        if let Some(turn) = next_turn {
            let _ = turn.send(());
        }
    }
}

/// A registered call. Dropping it removes the registry entry.
pub struct CallHandle {
    registry: CorrelationRegistry,
    key: Key,
    generation: u64,
    request: Arc<ForwardRequest>,
    reply: oneshot::Receiver<Outcome>,
}

impl CallHandle {
    pub fn id(&self) -> &CorrelationId {
        &self.key.1
    }

    /// Snapshot of the request this call carries.
    pub fn request(&self) -> &ForwardRequest {
        &self.request
    }

    /// Wait for the response, the timeout, or cancellation, whichever is
    /// first. The entry is removed before this returns.
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> Result<ForwardResponse> {
        let outcome = tokio::select! {
            biased;
            reply = &mut self.reply => match reply {
                Ok(Outcome::Resolved(response)) => Ok(response),
                Ok(Outcome::Failed(error)) => Err(error),
                Err(_) => Err(Error::SessionClosed(self.key.0)),
            },
            _ = cancel.cancelled() => {
                self.registry.mark(&self.key, self.generation, CallState::Failed);
                Err(Error::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                self.registry.mark(&self.key, self.generation, CallState::TimedOut);
                Err(Error::TimedOut)
            }
        };

        if let Err(e) = &outcome {
            debug!(session = %self.key.0, id = %self.key.1, error = %e, "call finished without response");
        }
        outcome
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.registry.release(&self.key, self.generation);
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("session", &self.key.0)
            .field("id", &self.key.1)
            .finish()
    }
}
