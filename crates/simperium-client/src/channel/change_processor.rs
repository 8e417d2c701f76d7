//! Sends local changes and applies remote ones for a channel
//!
//! One task per channel drains the remote queue, then the local queue, and
//! sleeps until more changes arrive. Only one change per object key is
//! pending at a time; a pending change is resent every retry delay until
//! the server acknowledges it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use simperium_api::protocol::{COMMAND_CHANGE, COMMAND_ENTITY, LOG_DEBUG, command};
use simperium_api::{Ghost, RemoteChange};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ChannelContext;
use super::change::Change;
use crate::error::{ClientError, Result};
use crate::storage::QueueSerializer;

#[derive(Default)]
struct QueueState {
    remote_queue: VecDeque<Value>,
    local_queue: Vec<Change>,
    /// Sent changes by object key
    pending: HashMap<String, Change>,
}

impl QueueState {
    fn has_queued_changes(&self) -> bool {
        !self.remote_queue.is_empty()
            || self
                .local_queue
                .iter()
                .any(|change| !self.pending.contains_key(change.key()))
    }

    fn is_pending(&self, change: &Change) -> bool {
        self.pending
            .get(change.key())
            .is_some_and(|pending| pending.ccid() == change.ccid())
    }
}

pub(crate) struct ChangeProcessor {
    ctx: Arc<ChannelContext>,
    serializer: Arc<dyn QueueSerializer>,
    retry_delay: Duration,
    runtime: Handle,
    state: Mutex<QueueState>,
    idle: AtomicBool,
    notify: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Retry timers by ccid
    retries: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ChangeProcessor {
    /// Restores queued and pending changes of the bucket; restored pending
    /// changes are retried.
    pub fn new(
        ctx: Arc<ChannelContext>,
        serializer: Arc<dyn QueueSerializer>,
        retry_delay: Duration,
        runtime: Handle,
    ) -> Arc<Self> {
        let restored = serializer.restore(ctx.bucket.name());
        let idle = restored.pending.is_empty() && restored.queued.is_empty();
        if !idle {
            info!(
                "Restored {} queued and {} pending changes for {}",
                restored.queued.len(),
                restored.pending.len(),
                ctx.bucket.name()
            );
        }

        let processor = Arc::new(Self {
            ctx,
            serializer,
            retry_delay,
            runtime,
            state: Mutex::new(QueueState {
                remote_queue: VecDeque::new(),
                local_queue: restored.queued,
                pending: restored.pending,
            }),
            idle: AtomicBool::new(idle),
            notify: Notify::new(),
            task: Mutex::new(None),
            retries: Mutex::new(HashMap::new()),
        });

        let pending: Vec<Change> = processor.state.lock().pending.values().cloned().collect();
        for change in &pending {
            processor.schedule_retry(change);
        }
        processor
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn pending_changes(&self) -> Vec<Change> {
        self.state.lock().pending.values().cloned().collect()
    }

    pub fn add_remote_changes(self: &Arc<Self>, changes: Vec<Value>) {
        let count = changes.len();
        self.state.lock().remote_queue.extend(changes);
        self.ctx.log(LOG_DEBUG, format!("Adding {count} remote changes to queue"));
        self.start();
    }

    /// Queues a local change. A modification replaces earlier queued
    /// changes of the same object.
    pub fn add_change(self: &Arc<Self>, change: Change) {
        self.ctx.log(
            LOG_DEBUG,
            format!(
                "Adding new change to queue {} {} {}",
                change.key(),
                change.operation(),
                change.ccid()
            ),
        );
        self.enqueue(change);
        self.start();
    }

    fn enqueue(&self, change: Change) {
        let mut state = self.state.lock();
        if change.is_modify() {
            let serializer = &self.serializer;
            state.local_queue.retain(|queued| {
                let replaced = queued.key() == change.key();
                if replaced {
                    serializer.on_dequeue_change(queued);
                }
                !replaced
            });
        }
        self.serializer.on_queue_change(&change);
        state.local_queue.push(change);
        self.idle.store(false, Ordering::SeqCst);
    }

    /// Wakes the processing task, spawning it when needed. Does nothing
    /// until the channel is started.
    pub fn start(self: &Arc<Self>) {
        if !self.ctx.is_started() {
            return;
        }

        let mut task = self.task.lock();
        if task.as_ref().is_none_or(JoinHandle::is_finished) {
            let processor = Arc::clone(self);
            *task = Some(self.runtime.spawn(async move { processor.run().await }));
        } else {
            self.notify.notify_one();
        }
    }

    /// Lets the processing task exit once the channel is stopped
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Drops every queued and pending change
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.pending.clear();
            state.local_queue.clear();
            state.remote_queue.clear();
        }
        for (_, retry) in self.retries.lock().drain() {
            retry.abort();
        }
        self.serializer.reset(self.ctx.bucket.name());
        self.idle.store(true, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>) {
        debug!("Starting change queue for {}", self.ctx.bucket.name());
        loop {
            if !self.ctx.is_started() || !self.ctx.have_index() {
                break;
            }
            self.idle.store(false, Ordering::SeqCst);

            self.process_remote_changes();
            self.process_local_changes();

            let waiting = {
                let state = self.state.lock();
                let queued = state.has_queued_changes();
                if queued && self.ctx.is_connected() {
                    false
                } else {
                    if !queued && state.pending.is_empty() {
                        self.idle.store(true, Ordering::SeqCst);
                    }
                    true
                }
            };
            if waiting {
                self.ctx.log(LOG_DEBUG, "Change queue is empty, waiting for changes");
                self.notify.notified().await;
            }
        }
        debug!("Change queue for {} stopped", self.ctx.bucket.name());
    }

    // ============== Remote changes ==============

    fn process_remote_changes(&self) {
        loop {
            let Some(value) = self.state.lock().remote_queue.pop_front() else {
                break;
            };
            let remote = match RemoteChange::from_value(value) {
                Ok(remote) => remote,
                Err(e) => {
                    warn!("Failed to build remote change: {}", e);
                    continue;
                }
            };
            self.ctx.log(
                LOG_DEBUG,
                format!("Processing remote change with cv: {}", remote.change_version()),
            );

            let acknowledged = {
                let mut state = self.state.lock();
                let matches = state
                    .pending
                    .get(&remote.key)
                    .is_some_and(|change| remote.is_acknowledged_by(change.ccid()));
                if matches {
                    state.pending.remove(&remote.key)
                } else {
                    None
                }
            };

            match acknowledged {
                Some(change) => self.on_acknowledged(&remote, change),
                None if remote.is_error() => {
                    debug!("Error response {} does not match a pending change", remote);
                }
                None => {
                    if let Err(e) = self.ctx.bucket.apply_remote_change(&remote) {
                        warn!("Remote change could not be applied: {}", e);
                        self.ctx.log(
                            LOG_DEBUG,
                            format!("Failed to apply change <{}> Reason: {}", remote.change_version(), e),
                        );
                        self.dequeue_local_changes(&remote.key);
                        self.request_object_version(&remote);
                    }
                }
            }

            if !remote.is_error() && remote.is_remove() {
                self.dequeue_local_changes(&remote.key);
            }
        }
    }

    fn on_acknowledged(&self, remote: &RemoteChange, mut change: Change) {
        self.ctx.log(
            LOG_DEBUG,
            format!(
                "Found pending change for remote change <{}>: {}",
                remote.change_version(),
                change.ccid()
            ),
        );
        self.serializer.on_acknowledge_change(&change);
        self.cancel_retry(change.ccid());

        if remote.is_error() {
            warn!("Change error response {:?} for {}", remote.error, remote.key);
            self.on_error(remote, change);
            return;
        }

        change.set_acknowledged();
        change.set_complete();
        let ghost = match self.ctx.bucket.acknowledge_change(remote, &change) {
            Ok(ghost) => ghost,
            Err(e) => {
                warn!("Remote change could not be acknowledged: {}", e);
                self.ctx.log(
                    LOG_DEBUG,
                    format!("Failed to acknowledge change <{}> Reason: {}", remote.change_version(), e),
                );
                self.request_object_version(remote);
                None
            }
        };

        // Queued changes of the object collapse into the newest one, which
        // is diffed against the new ghost when sent.
        let keep_newest = ghost.is_some() && !remote.is_remove();
        let mut state = self.state.lock();
        let mut collapsed: Option<Change> = None;
        let mut dropped = Vec::new();
        state.local_queue.retain(|queued| {
            if queued.key() != change.key() {
                return true;
            }
            if let Some(previous) = collapsed.replace(queued.clone()) {
                dropped.push(previous);
            }
            false
        });
        match collapsed {
            Some(newest) if keep_newest => state.local_queue.push(newest),
            Some(newest) => dropped.push(newest),
            None => {}
        }
        drop(state);
        for change in &dropped {
            self.serializer.on_dequeue_change(change);
        }
    }

    /// Handles an error response to one of our changes
    fn on_error(&self, remote: &RemoteChange, change: Change) {
        let code = remote.response_code();
        if code.requires_full_object() {
            self.requeue_with_full_object(change);
        } else {
            info!("Dropping change {} rejected with {:?}", change, code);
        }
    }

    fn requeue_with_full_object(&self, mut change: Change) {
        if change.reached_retry_limit() {
            self.complete_and_dequeue(&mut change);
            return;
        }
        change.increment_retry_count();
        change.set_send_full_object(true);
        self.enqueue(change);
    }

    fn dequeue_local_changes(&self, key: &str) {
        let mut state = self.state.lock();
        let serializer = &self.serializer;
        state.local_queue.retain(|queued| {
            let dequeued = queued.key() == key;
            if dequeued {
                serializer.on_dequeue_change(queued);
            }
            !dequeued
        });
    }

    fn request_object_version(&self, remote: &RemoteChange) {
        self.ctx.send(command(COMMAND_ENTITY, remote.object_version()));
    }

    // ============== Local changes ==============

    /// Sends queued changes. While disconnected they stay queued and no
    /// retry is scheduled.
    fn process_local_changes(self: &Arc<Self>) {
        if !self.ctx.is_connected() {
            return;
        }

        let to_send = {
            let mut state = self.state.lock();
            let queued = std::mem::take(&mut state.local_queue);
            let mut to_send = Vec::new();
            for change in queued {
                if state.pending.contains_key(change.key()) {
                    state.local_queue.push(change);
                } else {
                    state.pending.insert(change.key().to_string(), change.clone());
                    to_send.push(change);
                }
            }
            to_send
        };

        for mut change in to_send {
            match self.send_change(&mut change) {
                Ok(()) => {
                    if let Some(pending) = self.state.lock().pending.get_mut(change.key()) {
                        *pending = change.clone();
                    }
                    self.schedule_retry(&change);
                }
                Err(ClientError::NotConnected) => {
                    let mut state = self.state.lock();
                    state.pending.remove(change.key());
                    state.local_queue.push(change);
                }
                Err(e) => {
                    debug!("Change {} not sent: {}", change, e);
                    self.state.lock().pending.remove(change.key());
                }
            }
        }
    }

    /// Sends the change. Changes that can no longer be built are completed
    /// and dequeued.
    fn send_change(&self, change: &mut Change) -> Result<()> {
        if !self.ctx.is_connected() {
            return Err(ClientError::NotConnected);
        }

        self.ctx.log(
            LOG_DEBUG,
            format!(
                "Sending change for id: {} op: {} ccid: {}",
                change.key(),
                change.operation(),
                change.ccid()
            ),
        );

        let message = self.build_message(change);
        match message {
            Ok(message) => {
                self.ctx.send(command(COMMAND_CHANGE, Value::Object(message)));
                self.serializer.on_send_change(change);
                change.set_sent();
                Ok(())
            }
            Err(e) => {
                if matches!(
                    e,
                    ClientError::ObjectMissing { .. } | ClientError::GhostMissing { .. } | ClientError::ChangeEmpty(_)
                ) {
                    self.complete_and_dequeue(change);
                } else {
                    warn!("Could not send change {}: {}", change, e);
                }
                Err(e)
            }
        }
    }

    fn build_message(&self, change: &Change) -> Result<serde_json::Map<String, Value>> {
        let bucket = &self.ctx.bucket;
        let target = if change.is_remove() {
            None
        } else {
            Some(bucket.get_object_or_backup(change.key())?)
        };
        let ghost = match bucket.get_ghost(change.key()) {
            Ok(ghost) => ghost,
            Err(_) if change.is_remove() => Ghost::empty(change.key()),
            Err(e) => return Err(e),
        };
        change.to_message(
            bucket.differ(),
            target.as_ref().map(|object| object.properties()),
            &ghost,
        )
    }

    fn complete_and_dequeue(&self, change: &mut Change) {
        change.set_complete();
        self.cancel_retry(change.ccid());
        self.serializer.on_dequeue_change(change);
    }

    // ============== Retries ==============

    fn schedule_retry(self: &Arc<Self>, change: &Change) {
        let processor = Arc::downgrade(self);
        let key = change.key().to_string();
        let ccid = change.ccid().to_string();
        let delay = self.retry_delay;

        let retry = self.runtime.spawn({
            let ccid = ccid.clone();
            async move {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + delay, delay);
                loop {
                    interval.tick().await;
                    let Some(processor) = processor.upgrade() else {
                        break;
                    };
                    let pending = processor
                        .state
                        .lock()
                        .pending
                        .get(&key)
                        .filter(|change| change.ccid() == ccid)
                        .cloned();
                    let Some(mut change) = pending else {
                        break;
                    };
                    if !processor.ctx.is_started() {
                        continue;
                    }
                    processor.ctx.log(LOG_DEBUG, format!("Retrying change {ccid}"));
                    match processor.send_change(&mut change) {
                        Ok(()) | Err(ClientError::NotConnected) => {}
                        Err(_) => {
                            let mut state = processor.state.lock();
                            if state.is_pending(&change) {
                                state.pending.remove(&key);
                            }
                            break;
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.retries.lock().insert(ccid, retry) {
            previous.abort();
        }
    }

    fn cancel_retry(&self, ccid: &str) {
        if let Some(retry) = self.retries.lock().remove(ccid) {
            retry.abort();
        }
    }
}

impl Drop for ChangeProcessor {
    fn drop(&mut self) {
        for (_, retry) in self.retries.get_mut().drain() {
            retry.abort();
        }
    }
}
