use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use fndata_frame::{Chunk, LogicalEndpoint};

use crate::completion::Completion;
use crate::error::InboundError;
use crate::receiver::{ChunkConsumer, Inbound};

/// How long a removed instruction id is remembered for diagnostics.
const RETIRED_TTL: Duration = Duration::from_secs(600);
const RETIRED_MAX: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// Waiting for `is_last` on at least one endpoint.
    Active,
    /// Every endpoint ended; completion settled successfully.
    Complete,
    /// A decode or callback error, or the connection, failed it.
    Failed,
    /// Unregistered.
    Closed,
}

/// What happened to one chunk handed to an entry.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Delivered,
    EndpointComplete,
    Completed,
    Failed(InboundError),
    Discarded(&'static str),
}

/// Stream bookkeeping for one entry. Never held while a callback runs, so
/// a callback may fail or unregister its own entry without deadlocking.
struct Progress {
    open: HashSet<LogicalEndpoint>,
    state: EntryState,
    chunks: u64,
    bytes: u64,
}

type Consumers = HashMap<LogicalEndpoint, Box<dyn ChunkConsumer>>;

/// Receiver state for one instruction. Shared by every connection the
/// instruction was registered on.
pub(crate) struct InboundEntry {
    instruction_id: String,
    completion: Completion,
    /// Held for the duration of a callback.
    consumers: Mutex<Consumers>,
    progress: Mutex<Progress>,
}

pub(crate) type SharedEntry = Arc<InboundEntry>;

/// How long a reader waits between attempts to take an entry another
/// reader is delivering to.
const CONSUMER_BACKOFF: Duration = Duration::from_millis(1);

impl InboundEntry {
    pub(crate) fn new(instruction_id: &str, inbound: Inbound) -> Self {
        let consumers = inbound.into_consumers();
        let open: HashSet<LogicalEndpoint> = consumers.keys().cloned().collect();
        let completion = Completion::new();
        let state = if open.is_empty() {
            completion.settle(Ok(()));
            EntryState::Complete
        } else {
            EntryState::Active
        };

        Self {
            instruction_id: instruction_id.to_string(),
            completion,
            consumers: Mutex::new(consumers),
            progress: Mutex::new(Progress {
                open,
                state,
                chunks: 0,
                bytes: 0,
            }),
        }
    }

    pub(crate) fn shared(instruction_id: &str, inbound: Inbound) -> SharedEntry {
        Arc::new(Self::new(instruction_id, inbound))
    }

    pub(crate) fn completion(&self) -> Completion {
        self.completion.clone()
    }

    pub(crate) fn state(&self) -> EntryState {
        self.lock_progress().state
    }

    pub(crate) fn instruction_id(&self) -> &str {
        &self.instruction_id
    }

    pub(crate) fn stats(&self) -> (u64, u64) {
        let progress = self.lock_progress();
        (progress.chunks, progress.bytes)
    }

    /// Route one chunk to its endpoint's consumer.
    ///
    /// Callbacks for one instruction never run concurrently, even when it is
    /// registered on several connections.
    pub(crate) fn dispatch(&self, chunk: &Chunk) -> Dispatch {
        let Some(mut consumers) = self.lock_consumers() else {
            return Dispatch::Discarded("receiver no longer active");
        };
        let Some(consumer) = consumers.get_mut(&chunk.endpoint) else {
            return Dispatch::Discarded("endpoint not registered for instruction");
        };

        {
            let mut progress = self.lock_progress();
            if progress.state != EntryState::Active {
                return Dispatch::Discarded("receiver no longer active");
            }
            if !progress.open.contains(&chunk.endpoint) {
                return Dispatch::Discarded("stream already ended");
            }
            progress.chunks += 1;
            progress.bytes += chunk.payload.len() as u64;
        }

        if !chunk.payload.is_empty() {
            if let Err(err) = consumer.consume(&chunk.endpoint, &chunk.payload) {
                drop(consumers);
                self.fail(err.clone());
                return Dispatch::Failed(err);
            }
        }
        drop(consumers);

        let mut progress = self.lock_progress();
        // Failed or unregistered while the callback ran.
        if progress.state != EntryState::Active {
            return Dispatch::Discarded("receiver no longer active");
        }
        if !chunk.is_last {
            return Dispatch::Delivered;
        }

        progress.open.remove(&chunk.endpoint);
        if !progress.open.is_empty() {
            return Dispatch::EndpointComplete;
        }
        progress.state = EntryState::Complete;
        self.completion.settle(Ok(()));
        Dispatch::Completed
    }

    /// Fail an active entry. Returns `false` if it had already settled.
    pub(crate) fn fail(&self, err: InboundError) -> bool {
        let mut progress = self.lock_progress();
        if progress.state != EntryState::Active {
            return false;
        }
        progress.state = EntryState::Failed;
        self.completion.settle(Err(err));
        true
    }

    /// Unregister: a still-active entry settles successfully.
    pub(crate) fn close(&self) -> EntryState {
        let mut progress = self.lock_progress();
        let previous = progress.state;
        if previous == EntryState::Active {
            self.completion.settle(Ok(()));
        }
        if previous != EntryState::Failed {
            progress.state = EntryState::Closed;
        }
        previous
    }

    fn lock_progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the consumer lock, giving up once the entry stops being active
    /// so a reader waiting behind another connection's callback can exit.
    fn lock_consumers(&self) -> Option<MutexGuard<'_, Consumers>> {
        loop {
            match self.consumers.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if self.state() != EntryState::Active {
                        return None;
                    }
                    thread::sleep(CONSUMER_BACKOFF);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retired {
    /// Removed by the reader loop after a failure; not yet unregistered.
    Failed,
    /// Removed by the caller.
    Unregistered,
}

/// Active receivers of one connection, keyed by instruction id, plus a
/// bounded memory of recently removed ids.
#[derive(Default)]
pub(crate) struct ReceiverRegistry {
    entries: HashMap<String, SharedEntry>,
    retired: HashMap<String, (Retired, Instant)>,
}

impl ReceiverRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Install `entry`. Returns `false` if the id is already taken.
    pub(crate) fn insert(&mut self, instruction_id: &str, entry: SharedEntry) -> bool {
        if self.entries.contains_key(instruction_id) {
            return false;
        }
        self.retired.remove(instruction_id);
        self.entries.insert(instruction_id.to_string(), entry);
        true
    }

    pub(crate) fn get(&self, instruction_id: &str) -> Option<SharedEntry> {
        self.entries.get(instruction_id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, instruction_id: &str) -> bool {
        self.entries.contains_key(instruction_id)
    }

    /// Remove `instruction_id` only if it still maps to `entry`.
    pub(crate) fn remove_if_same(&mut self, instruction_id: &str, entry: &SharedEntry) -> bool {
        match self.entries.get(instruction_id) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                self.entries.remove(instruction_id);
                true
            }
            _ => false,
        }
    }

    /// Remove a failed entry and remember why.
    pub(crate) fn retire_failed(&mut self, instruction_id: &str, entry: &SharedEntry) {
        if self.remove_if_same(instruction_id, entry) {
            self.remember(instruction_id, Retired::Failed);
        }
    }

    /// Caller-driven removal.
    pub(crate) fn unregister(&mut self, instruction_id: &str) -> Unregistered {
        if let Some(entry) = self.entries.remove(instruction_id) {
            self.remember(instruction_id, Retired::Unregistered);
            return Unregistered::Removed(entry);
        }
        match self.retired_kind(instruction_id) {
            Some(Retired::Failed) => {
                self.remember(instruction_id, Retired::Unregistered);
                Unregistered::AlreadyFailed
            }
            _ => Unregistered::Unknown,
        }
    }

    /// Why `instruction_id` is no longer registered, if it recently was.
    pub(crate) fn retired_kind(&mut self, instruction_id: &str) -> Option<Retired> {
        let now = Instant::now();
        match self.retired.get(instruction_id) {
            Some(&(kind, at)) if now.duration_since(at) < RETIRED_TTL => Some(kind),
            Some(_) => {
                self.retired.remove(instruction_id);
                None
            }
            None => None,
        }
    }

    /// Take every entry for failing, leaving the registry empty. Each id is
    /// remembered as failed so a later unregister is a no-op.
    pub(crate) fn drain_failed(&mut self) -> Vec<(String, SharedEntry)> {
        let drained: Vec<_> = self.entries.drain().collect();
        for (instruction_id, _) in &drained {
            self.remember(instruction_id, Retired::Failed);
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn remember(&mut self, instruction_id: &str, kind: Retired) {
        let now = Instant::now();
        if self.retired.len() >= RETIRED_MAX {
            self.retired
                .retain(|_, (_, at)| now.duration_since(*at) < RETIRED_TTL);
        }
        if self.retired.len() >= RETIRED_MAX {
            let oldest = self
                .retired
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                self.retired.remove(&oldest);
            }
        }
        self.retired.insert(instruction_id.to_string(), (kind, now));
    }
}

pub(crate) enum Unregistered {
    Removed(SharedEntry),
    AlreadyFailed,
    Unknown,
}
