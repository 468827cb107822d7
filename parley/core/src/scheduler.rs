//! Conversation Scheduler - Single-Flight Tasks per Client or Group
//!
//! At most one conversation runs per [`TaskKey`]. Each key moves through
//!
//! ```text
//! absent ──start──▶ running ──┬── completed ──┐
//!                             ├── failed ─────┼──▶ absent
//!                             └── cancelled ──┘
//! ```
//!
//! A second `start` for a running key is refused with
//! [`StartOutcome::AlreadyRunning`] and leaves the running task alone.
//!
//! # Cancellation
//!
//! Every task gets a [`TaskContext`]: a cancellation token plus a tracker for
//! the child tasks it spawns (synthesis fragments, delivery drainers). Tearing a
//! task down cancels the token, waits for the body and every tracked child to
//! finish, and only then clears the slot. [`ConversationScheduler::interrupt`]
//! returns after that teardown, so an immediately following `start` for the
//! same key succeeds.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::TurnError;
use crate::groups::GroupId;
use crate::session::ClientId;

/// What a conversation task is scheduled under
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// A one-on-one conversation
    Client(ClientId),
    /// A group conversation
    Group(GroupId),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(id) => write!(f, "client:{id}"),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

/// Result of [`ConversationScheduler::start`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new task was spawned
    Started,
    /// A task for this key is still running; nothing was spawned
    AlreadyRunning,
}

/// How a task ended
#[derive(Debug)]
enum TaskExit {
    Completed,
    Failed(TurnError),
    Cancelled,
    Panicked,
}

/// Cancellation scope handed to a conversation body
///
/// Cloning shares the token and tracker.
#[derive(Clone, Debug, Default)]
pub struct TaskContext {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TaskContext {
    /// A fresh, uncancelled scope
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the task is interrupted
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the task has been asked to stop
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A nested scope: cancelled with this one, but cancellable on its own
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            tracker: self.tracker.clone(),
        }
    }

    /// Cancel this scope and everything nested in it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Spawn a child task that stops when this scope is cancelled
    ///
    /// Resolves to `None` if cancellation won.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                output = future => Some(output),
            }
        })
    }

    /// Number of spawned children still running
    #[must_use]
    pub fn running_children(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting children and wait for the running ones
    async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// One occupied key
#[derive(Debug)]
struct Slot {
    generation: u64,
    context: TaskContext,
    /// Cancelled once the slot has been cleared
    finished: CancellationToken,
}

/// Clears a slot however the supervisor exits
struct SlotGuard {
    slots: Arc<DashMap<TaskKey, Slot>>,
    key: TaskKey,
    generation: u64,
    finished: CancellationToken,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // A newer task may already own the key
        self.slots
            .remove_if(&self.key, |_, slot| slot.generation == self.generation);
        self.finished.cancel();
    }
}

/// Enforces at most one in-flight conversation per key
///
/// Cheap to clone; clones share the same slots.
#[derive(Clone, Default)]
pub struct ConversationScheduler {
    slots: Arc<DashMap<TaskKey, Slot>>,
    generation: Arc<AtomicU64>,
}

impl ConversationScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a task for `key` unless one is already running
    ///
    /// `body` receives the task's [`TaskContext`]. Its error, if any, is logged
    /// here; reporting it to clients is the body's own job.
    pub fn start<F, Fut>(&self, key: TaskKey, body: F) -> StartOutcome
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<(), TurnError>> + Send + 'static,
    {
        let vacant = match self.slots.entry(key.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(task = %key, "Conversation already running, start refused");
                return StartOutcome::AlreadyRunning;
            }
            Entry::Vacant(vacant) => vacant,
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let context = TaskContext::new();
        let finished = CancellationToken::new();
        let guard = SlotGuard {
            slots: Arc::clone(&self.slots),
            key: key.clone(),
            generation,
            finished: finished.clone(),
        };

        let body = body(context.clone());
        tokio::spawn(supervise(key.clone(), context.clone(), body, guard));
        vacant.insert(Slot {
            generation,
            context,
            finished,
        });

        tracing::debug!(task = %key, generation, "Conversation task started");
        StartOutcome::Started
    }

    /// Cancel the task for `key` and wait until its slot is clear
    ///
    /// Returns false if nothing was running.
    pub async fn interrupt(&self, key: &TaskKey) -> bool {
        let Some((context, finished)) = self
            .slots
            .get(key)
            .map(|slot| (slot.context.clone(), slot.finished.clone()))
        else {
            return false;
        };

        tracing::info!(task = %key, "Interrupting conversation task");
        context.cancel();
        finished.cancelled().await;
        true
    }

    /// Wait for the task under `key` to end on its own
    pub async fn wait(&self, key: &TaskKey) {
        let finished = self.slots.get(key).map(|slot| slot.finished.clone());
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
    }

    /// Whether a task is running for `key`
    #[must_use]
    pub fn is_running(&self, key: &TaskKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Number of running tasks
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    /// Keys with a running task
    #[must_use]
    pub fn active_keys(&self) -> Vec<TaskKey> {
        self.slots.iter().map(|slot| slot.key().clone()).collect()
    }

    /// Interrupt every running task and wait for all of them
    pub async fn shutdown_all(&self) {
        let keys = self.active_keys();
        tracing::info!(count = keys.len(), "Interrupting all conversation tasks");
        futures::future::join_all(keys.iter().map(|key| self.interrupt(key))).await;
    }
}

impl fmt::Debug for ConversationScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationScheduler")
            .field("active", &self.active_keys())
            .finish()
    }
}

/// Run `body` to completion or cancellation, then tear down and clear the slot
async fn supervise<Fut>(key: TaskKey, context: TaskContext, body: Fut, guard: SlotGuard)
where
    Fut: Future<Output = Result<(), TurnError>> + Send + 'static,
{
    // A separate task so a panicking body still reaches the teardown below
    let mut task = tokio::spawn(body);

    let exit = tokio::select! {
        joined = &mut task => match joined {
            Ok(Ok(())) => TaskExit::Completed,
            Ok(Err(e)) if e.is_cancelled() => TaskExit::Cancelled,
            Ok(Err(e)) => TaskExit::Failed(e),
            Err(e) if e.is_cancelled() => TaskExit::Cancelled,
            Err(_) => TaskExit::Panicked,
        },
        () = context.token().cancelled() => {
            task.abort();
            let _ = task.await;
            TaskExit::Cancelled
        }
    };

    // Nothing the body spawned outlives it
    context.cancel();
    context.drain().await;

    match exit {
        TaskExit::Completed => tracing::debug!(task = %key, "Conversation task completed"),
        TaskExit::Cancelled => tracing::info!(task = %key, "Conversation task cancelled"),
        TaskExit::Failed(e) => tracing::warn!(task = %key, error = %e, "Conversation task failed"),
        TaskExit::Panicked => tracing::error!(task = %key, "Conversation task panicked"),
    }

    drop(guard);
}
