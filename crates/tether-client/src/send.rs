//! Outbound send pipeline.
//!
//! A message is persisted before any network call. Online sends run on a
//! background task per message id: the task waits for pending attachment
//! uploads (observed through the repository feed), then transmits. Offline
//! sends return [`SendOutcome::Queued`] immediately.
//!
//! # Invariants
//!
//! - Every message handed to [`SendPipeline::send`] ends up in the
//!   repository; online sends end `Synced` or `Failed` unless an error
//!   handler substitutes a result.
//! - At most one task per message id is waiting; a new send or retry for the
//!   same id aborts the previous task.
//! - A message is transmitted at most once: the transmit stage is serialized
//!   per message id and re-checks the repository for `Synced` before sending.
//!   Different messages transmit concurrently.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::{
    ChatError, Environment,
    message::{Attachment, AttachmentAggregate, OutboundMessage, SyncStatus, aggregate},
};
use tokio::{
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
    task::AbortHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{RepositoryError, SendError},
    error_handler::{Call, CallOutput, ErrorHandlerChain},
    repository::MessageRepository,
    upload::AttachmentUploader,
};

/// Sends a prepared message to the server.
#[async_trait]
pub trait MessageTransmitter: Send + Sync {
    /// Deliver `message`. Returns once the server accepted it.
    async fn transmit(&self, message: &OutboundMessage) -> Result<(), ChatError>;
}

/// Whether sends should go to the network now.
pub trait Connectivity: Send + Sync {
    /// `true` while a live connection is available.
    fn is_online(&self) -> bool;
}

/// Result of a send or retry that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The server has the message.
    Synced(OutboundMessage),
    /// Offline; persisted with `SyncNeeded` or `AwaitingAttachments` for a
    /// later retry.
    Queued(OutboundMessage),
    /// The send failed but an error handler substituted this result.
    Recovered(OutboundMessage),
}

impl SendOutcome {
    /// The message as persisted or substituted.
    pub fn message(&self) -> &OutboundMessage {
        match self {
            Self::Synced(m) | Self::Queued(m) | Self::Recovered(m) => m,
        }
    }

    /// Shorthand for `self.message().sync_status`.
    pub fn sync_status(&self) -> SyncStatus {
        self.message().sync_status
    }
}

struct TaskEntry {
    generation: u64,
    abort: AbortHandle,
    /// Set once the task owns the transmit stage; it is no longer aborted.
    committed: Arc<AtomicBool>,
}

/// Async locks keyed by message id. An entry lives while a task holds or
/// waits on it.
#[derive(Default)]
struct TransmitLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TransmitLocks {
    async fn acquire(&self, message_id: &str) -> TransmitGuard<'_> {
        let lock = Arc::clone(self.locks.lock().entry(message_id.to_string()).or_default());
        let held = lock.lock_owned().await;
        TransmitGuard { locks: self, message_id: message_id.to_string(), _held: held }
    }
}

struct TransmitGuard<'a> {
    locks: &'a TransmitLocks,
    message_id: String,
    _held: OwnedMutexGuard<()>,
}

impl Drop for TransmitGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock();
        // The map and this guard are the only owners: nobody is waiting.
        if locks.get(&self.message_id).is_some_and(|lock| Arc::strong_count(lock) == 2) {
            locks.remove(&self.message_id);
        }
    }
}

struct Inner<E> {
    env: E,
    repository: Arc<dyn MessageRepository>,
    uploader: Arc<dyn AttachmentUploader>,
    transmitter: Arc<dyn MessageTransmitter>,
    connectivity: Arc<dyn Connectivity>,
    handlers: ErrorHandlerChain,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    next_generation: AtomicU64,
    transmit_locks: TransmitLocks,
}

/// Persist-first message sender. Cheap to clone.
pub struct SendPipeline<E: Environment> {
    inner: Arc<Inner<E>>,
}

impl<E: Environment> Clone for SendPipeline<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment> fmt::Debug for SendPipeline<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendPipeline")
            .field("in_flight", &self.in_flight())
            .field("handlers", &self.inner.handlers)
            .finish_non_exhaustive()
    }
}

impl<E: Environment> SendPipeline<E> {
    /// Pipeline over its collaborators.
    pub fn new(
        env: E,
        repository: Arc<dyn MessageRepository>,
        uploader: Arc<dyn AttachmentUploader>,
        transmitter: Arc<dyn MessageTransmitter>,
        connectivity: Arc<dyn Connectivity>,
        handlers: ErrorHandlerChain,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                env,
                repository,
                uploader,
                transmitter,
                connectivity,
                handlers,
                tasks: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                transmit_locks: TransmitLocks::default(),
            }),
        }
    }

    /// Prepare, persist and (when online) deliver `message`.
    ///
    /// A message whose id is already `Synced` in the repository is returned
    /// as is without transmitting.
    pub async fn send(&self, mut message: OutboundMessage) -> Result<SendOutcome, SendError> {
        let inner = &self.inner;
        if let Some(synced) = inner.synced(&message.id)? {
            debug!(message_id = %synced.id, "message already synced");
            return Ok(SendOutcome::Synced(synced));
        }

        let online = inner.connectivity.is_online();
        message.prepare(&inner.env, online);
        inner.repository.insert_message(&message)?;

        if !online {
            inner.supersede(&message.id);
            info!(message_id = %message.id, status = ?message.sync_status, "offline, message queued");
            return Ok(SendOutcome::Queued(message));
        }

        self.run(message).await
    }

    /// Re-enter the upload and transmit path for a stored message.
    ///
    /// Keeps the message's id and creation time. Failed attachment uploads
    /// are re-queued; uploaded ones are not uploaded again.
    pub async fn retry(&self, message_id: &str) -> Result<SendOutcome, SendError> {
        let inner = &self.inner;
        let mut message = inner
            .repository
            .select_message(message_id)?
            .ok_or_else(|| SendError::NotFound { message_id: message_id.to_string() })?;

        if message.sync_status == SyncStatus::Synced {
            return Ok(SendOutcome::Synced(message));
        }
        if message.sync_status == SyncStatus::Failed {
            message.set_sync_status(SyncStatus::SyncNeeded)?;
        }

        let reset = message.reset_failed_attachments(&inner.env);
        message.updated_at = Some(inner.env.wall_clock_millis());
        inner.repository.insert_message(&message)?;
        debug!(%message_id, reset, "retrying message");

        if !inner.connectivity.is_online() {
            inner.supersede(message_id);
            return Ok(SendOutcome::Queued(message));
        }

        self.run(message).await
    }

    /// Messages with a running send task.
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    async fn run(&self, message: OutboundMessage) -> Result<SendOutcome, SendError> {
        let inner = Arc::clone(&self.inner);
        let message_id = message.id.clone();
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let committed = Arc::new(AtomicBool::new(false));

        let task = {
            // Held across spawn + insert so the task cannot check its
            // generation before the entry exists.
            let mut tasks = inner.tasks.lock();
            let task = tokio::spawn({
                let inner = Arc::clone(&inner);
                let committed = Arc::clone(&committed);
                async move {
                    let id = message.id.clone();
                    let result = inner.drive(message, generation, &committed).await;
                    inner.finish(&id, generation);
                    result
                }
            });

            let entry = TaskEntry { generation, abort: task.abort_handle(), committed };
            if let Some(previous) = tasks.insert(message_id.clone(), entry) {
                cancel(&message_id, &previous);
            }
            task
        };

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(SendError::Superseded { message_id }),
            Err(e) => Err(SendError::Task(e.to_string())),
        }
    }
}

fn cancel(message_id: &str, entry: &TaskEntry) {
    if entry.committed.load(Ordering::Acquire) {
        debug!(%message_id, "previous send already transmitting, letting it finish");
    } else {
        debug!(%message_id, generation = entry.generation, "superseding previous send");
        entry.abort.abort();
    }
}

impl<E: Environment> Inner<E> {
    fn synced(&self, message_id: &str) -> Result<Option<OutboundMessage>, RepositoryError> {
        if message_id.is_empty() {
            return Ok(None);
        }
        let stored = self.repository.select_message(message_id)?;
        Ok(stored.filter(|m| m.sync_status == SyncStatus::Synced))
    }

    fn supersede(&self, message_id: &str) {
        if let Some(previous) = self.tasks.lock().remove(message_id) {
            cancel(message_id, &previous);
        }
    }

    fn finish(&self, message_id: &str, generation: u64) {
        let mut tasks = self.tasks.lock();
        if tasks.get(message_id).is_some_and(|e| e.generation == generation) {
            tasks.remove(message_id);
        }
    }

    fn persist(&self, message: &mut OutboundMessage) -> Result<(), RepositoryError> {
        message.updated_at = Some(self.env.wall_clock_millis());
        self.repository.insert_message(message)
    }

    async fn drive(
        &self,
        mut message: OutboundMessage,
        generation: u64,
        committed: &AtomicBool,
    ) -> Result<SendOutcome, SendError> {
        if message.pending_attachments().next().is_some() {
            if let Some((attachment_id, reason)) = self.await_attachments(&mut message).await? {
                return self.fail_attachments(message, attachment_id, reason).await;
            }
        }
        self.transmit(message, generation, committed).await
    }

    /// Enqueue pending uploads and wait until they all succeed or one fails.
    ///
    /// Returns the first failure, or `None` once every attachment is uploaded.
    async fn await_attachments(
        &self,
        message: &mut OutboundMessage,
    ) -> Result<Option<(String, String)>, SendError> {
        if message.sync_status != SyncStatus::AwaitingAttachments {
            message.set_sync_status(SyncStatus::AwaitingAttachments)?;
            self.persist(message)?;
        }

        let mut feed = self.repository.observe_attachments(&message.id);
        let pending: Vec<Attachment> = message.pending_attachments().cloned().collect();
        debug!(message_id = %message.id, pending = pending.len(), "waiting for uploads");

        if let Err(e) = self.uploader.enqueue(message, &pending).await {
            let first = pending.first().map(|a| a.id.clone()).unwrap_or_default();
            return Ok(Some((first, e.to_string())));
        }

        loop {
            let attachments = feed.borrow_and_update().clone();
            match aggregate(&attachments) {
                AttachmentAggregate::Ready => {
                    message.attachments = attachments;
                    return Ok(None);
                },
                AttachmentAggregate::Failed { attachment_id, error } => {
                    message.attachments = attachments;
                    return Ok(Some((attachment_id, error)));
                },
                AttachmentAggregate::Pending => {},
            }

            if feed.changed().await.is_err() {
                return Err(RepositoryError::Storage("attachment feed closed".into()).into());
            }
        }
    }

    async fn fail_attachments(
        &self,
        mut message: OutboundMessage,
        attachment_id: String,
        reason: String,
    ) -> Result<SendOutcome, SendError> {
        self.uploader.cancel(&message.id).await;
        message.set_sync_status(SyncStatus::Failed)?;
        self.persist(&mut message)?;
        warn!(message_id = %message.id, %attachment_id, %reason, "attachment upload failed");

        let cause = ChatError::AttachmentUpload { attachment_id, reason };
        match self.recover(&message, &cause).await? {
            Some(recovered) => Ok(SendOutcome::Recovered(recovered)),
            None => Err(SendError::AttachmentUpload { message: Box::new(message), cause }),
        }
    }

    async fn transmit(
        &self,
        mut message: OutboundMessage,
        generation: u64,
        committed: &AtomicBool,
    ) -> Result<SendOutcome, SendError> {
        let _transmitting = self.transmit_locks.acquire(&message.id).await;
        {
            let tasks = self.tasks.lock();
            if !tasks.get(&message.id).is_some_and(|e| e.generation == generation) {
                return Err(SendError::Superseded { message_id: message.id });
            }
            committed.store(true, Ordering::Release);
        }

        // An earlier committed send may have delivered it while we waited.
        if let Some(synced) = self.synced(&message.id)? {
            return Ok(SendOutcome::Synced(synced));
        }

        message.set_sync_status(SyncStatus::InProgress)?;
        self.persist(&mut message)?;

        match self.transmitter.transmit(&message).await {
            Ok(()) => {
                message.mark_synced()?;
                self.persist(&mut message)?;
                info!(message_id = %message.id, "message synced");
                Ok(SendOutcome::Synced(message))
            },
            Err(cause) => {
                warn!(message_id = %message.id, error = %cause, "transmit failed");
                message.set_sync_status(SyncStatus::Failed)?;
                self.persist(&mut message)?;

                match self.recover(&message, &cause).await? {
                    Some(recovered) => Ok(SendOutcome::Recovered(recovered)),
                    None => Err(SendError::Transmit { message: Box::new(message), cause }),
                }
            },
        }
    }

    /// Offer a failed send to the handler chain; persists a substitute.
    async fn recover(
        &self,
        message: &OutboundMessage,
        cause: &ChatError,
    ) -> Result<Option<OutboundMessage>, SendError> {
        match self.handlers.recover(&Call::SendMessage(message.clone()), cause).await {
            Some(CallOutput::Message(recovered)) => {
                self.repository.insert_message(&recovered)?;
                Ok(Some(recovered))
            },
            Some(other) => {
                warn!(message_id = %message.id, ?other, "handler returned a non-message result");
                Ok(None)
            },
            None => Ok(None),
        }
    }
}
