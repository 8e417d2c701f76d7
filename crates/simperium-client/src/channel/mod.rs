//! Bucket channel: the command handlers that sync one bucket over the
//! shared websocket
//!
//! A channel never touches the socket. Outgoing messages and log lines are
//! sent as [`ChannelEvent`]s to the websocket manager, which prefixes them
//! with the channel id. Incoming channel messages arrive through
//! [`Channel::receive_message`].

mod change;
mod change_processor;
mod index_processor;
mod revisions;

pub use change::{Change, RETRY_LIMIT, new_ccid};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use simperium_api::model::RESPONSE_UNKNOWN;
use simperium_api::protocol::{
    API_VERSION, AuthResponse, COMMAND_AUTH, COMMAND_CHANGE, COMMAND_ENTITY, COMMAND_INDEX, COMMAND_INDEX_STATE,
    COMMAND_VERSION, IndexQuery, InitMessage, LOG_DEBUG, command, split_command,
};
use simperium_api::{IndexEntry, IndexExtra, IndexPage, IndexStatus, ObjectVersion, ObjectVersionData, PendingEntry};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use self::change_processor::ChangeProcessor;
use self::index_processor::IndexProcessor;
use self::revisions::RevisionsCollector;
use crate::bucket::{Bucket, BucketChannel, RevisionsCallbacks};
use crate::config::SimperiumConfig;
use crate::error::{ClientError, Result};
use crate::storage::QueueSerializer;
use crate::user::UserStatus;

/// Version number reported in `init`
pub const LIBRARY_VERSION: u32 = 0;

/// Messages from a channel to the websocket manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel message to send on the socket
    Message { channel_id: usize, message: String },
    /// Log line for the remote log, sent when `level` is enabled
    Log {
        channel_id: usize,
        level: i32,
        message: String,
    },
    /// The channel wants to start and needs a connection
    Open(usize),
    /// The channel stopped
    Close(usize),
}

/// State shared by a channel and its processors
pub(crate) struct ChannelContext {
    pub id: usize,
    pub bucket: Arc<Bucket>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    started: AtomicBool,
    connected: AtomicBool,
    have_index: AtomicBool,
    start_on_connect: AtomicBool,
}

impl ChannelContext {
    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            debug!("Channel {} has no websocket manager", self.id);
        }
    }

    pub fn send(&self, message: String) {
        self.emit(ChannelEvent::Message {
            channel_id: self.id,
            message,
        });
    }

    pub fn log(&self, level: i32, message: impl Into<String>) {
        self.emit(ChannelEvent::Log {
            channel_id: self.id,
            level,
            message: message.into(),
        });
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn have_index(&self) -> bool {
        self.have_index.load(Ordering::SeqCst)
    }
}

/// Syncs one bucket
pub struct Channel {
    ctx: Arc<ChannelContext>,
    app_id: String,
    session_id: String,
    library: String,
    change_processor: Arc<ChangeProcessor>,
    index_processor: Mutex<Option<IndexProcessor>>,
    collectors: Mutex<Vec<RevisionsCollector>>,
}

impl Channel {
    /// Creates the channel and attaches it to `bucket`. Must be called from
    /// within a tokio runtime.
    pub fn new(
        id: usize,
        bucket: Arc<Bucket>,
        serializer: Arc<dyn QueueSerializer>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        config: &SimperiumConfig,
        session_id: &str,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|e| ClientError::Other(e.into()))?;

        let ctx = Arc::new(ChannelContext {
            id,
            bucket: Arc::clone(&bucket),
            events,
            started: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            have_index: AtomicBool::new(false),
            start_on_connect: AtomicBool::new(false),
        });
        let change_processor = ChangeProcessor::new(
            Arc::clone(&ctx),
            serializer,
            config.retry_delay(),
            runtime,
        );

        let channel = Arc::new(Self {
            ctx,
            app_id: config.app_id.clone(),
            session_id: session_id.to_string(),
            library: config.library.clone(),
            change_processor,
            index_processor: Mutex::new(None),
            collectors: Mutex::new(Vec::new()),
        });

        let as_channel: Arc<dyn BucketChannel> = channel.clone();
        bucket.set_channel(Arc::downgrade(&as_channel));
        Ok(channel)
    }

    pub fn id(&self) -> usize {
        self.ctx.id
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.ctx.bucket
    }

    pub fn bucket_name(&self) -> &str {
        self.ctx.bucket.name()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_started(&self) -> bool {
        self.ctx.is_started()
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_connected()
    }

    pub fn have_complete_index(&self) -> bool {
        self.ctx.have_index()
    }

    pub fn pending_changes(&self) -> Vec<Change> {
        self.change_processor.pending_changes()
    }

    // ============== Connection ==============

    pub fn on_connect(&self) {
        self.ctx.connected.store(true, Ordering::SeqCst);
        let start = self.ctx.start_on_connect.load(Ordering::SeqCst);
        debug!("Channel {} connected, auto start: {}", self.bucket_name(), start);
        if start {
            self.start_channel();
        }
    }

    /// The socket closed; a started channel starts again on reconnect.
    pub fn on_disconnect(&self) {
        if self.ctx.started.swap(false, Ordering::SeqCst) {
            self.ctx.start_on_connect.store(true, Ordering::SeqCst);
        }
        self.ctx.connected.store(false, Ordering::SeqCst);
        self.change_processor.wake();
    }

    fn start_channel(&self) {
        if self.ctx.is_started() {
            return;
        }

        if !self.ctx.is_connected() {
            self.ctx.start_on_connect.store(true, Ordering::SeqCst);
            self.ctx.emit(ChannelEvent::Open(self.ctx.id));
            return;
        }

        let bucket = &self.ctx.bucket;
        let Some(token) = bucket.user().access_token().filter(|token| !token.is_empty()) else {
            debug!("Channel {} has no access token, not starting", self.bucket_name());
            return;
        };

        self.ctx.started.store(true, Ordering::SeqCst);
        let cmd = if bucket.has_change_version() {
            self.ctx.have_index.store(true, Ordering::SeqCst);
            command(COMMAND_VERSION, bucket.get_change_version())
        } else {
            self.ctx.have_index.store(false, Ordering::SeqCst);
            IndexQuery::new().to_string()
        };

        let init = InitMessage {
            api: API_VERSION.to_string(),
            client_id: self.session_id.clone(),
            app_id: self.app_id.clone(),
            token,
            name: bucket.remote_name().to_string(),
            cmd,
            library: self.library.clone(),
            version: LIBRARY_VERSION,
        };
        info!("Starting channel {} for bucket {}", self.ctx.id, bucket.name());
        self.ctx.send(init.to_command());

        // flush changes restored or queued while stopped
        self.change_processor.start();
    }

    fn stop_channel(&self) {
        self.ctx.start_on_connect.store(false, Ordering::SeqCst);
        self.ctx.started.store(false, Ordering::SeqCst);
        self.change_processor.wake();
        self.ctx.emit(ChannelEvent::Close(self.ctx.id));
    }

    // ============== Incoming messages ==============

    /// Handles a channel message (without the channel id prefix)
    pub fn receive_message(&self, message: &str) {
        let (name, param) = split_command(message);
        match name {
            COMMAND_AUTH => self.handle_auth(param),
            COMMAND_INDEX => self.handle_index_page(param),
            COMMAND_CHANGE => self.handle_remote_changes(param),
            COMMAND_ENTITY => self.handle_object_data(param),
            COMMAND_INDEX_STATE => self.send_index_status(),
            COMMAND_VERSION => self.handle_version(param),
            _ => warn!("Unknown command received: {}", name),
        }
    }

    fn handle_auth(&self, param: &str) {
        let user = self.ctx.bucket.user();
        match AuthResponse::parse(param) {
            AuthResponse::Expired => {}
            AuthResponse::Unauthorized(code) => {
                warn!("Channel {} token rejected with {}", self.bucket_name(), code);
                user.set_status(UserStatus::NotAuthorized);
                self.stop_channel();
            }
            AuthResponse::Failed(code) => {
                warn!("Channel {} auth failed with {}", self.bucket_name(), code);
            }
            AuthResponse::Authorized(email) => {
                user.set_email(&email);
                user.set_status(UserStatus::Authorized);
            }
        }
    }

    fn handle_index_page(&self, param: &str) {
        if param == RESPONSE_UNKNOWN {
            return;
        }
        let page = match serde_json::from_str::<IndexPage>(param) {
            Ok(page) => page,
            Err(e) => {
                warn!("Index page for {} is malformed: {}", self.bucket_name(), e);
                return;
            }
        };

        let completion = {
            let mut processor = self.index_processor.lock();
            let accepted = processor
                .as_mut()
                .is_some_and(|processor| processor.add_index_page(&page));
            if !accepted {
                let mut fresh = IndexProcessor::new(Arc::clone(&self.ctx), page.current_version());
                fresh.add_index_page(&page);
                *processor = Some(fresh);
            }
            processor.as_mut().and_then(IndexProcessor::take_completion)
        };
        if let Some(change_version) = completion {
            self.index_complete(&change_version);
        }
    }

    fn index_complete(&self, change_version: &str) {
        {
            let mut processor = self.index_processor.lock();
            if processor
                .as_ref()
                .is_some_and(|processor| processor.change_version() == change_version)
            {
                *processor = None;
            }
        }
        if let Err(e) = self.ctx.bucket.index_complete(change_version) {
            warn!("Unable to store change version for {}: {}", self.bucket_name(), e);
        }
        info!("Index of {} complete at {}", self.bucket_name(), change_version);
        self.ctx.have_index.store(true, Ordering::SeqCst);
        self.change_processor.start();
    }

    fn handle_remote_changes(&self, param: &str) {
        if param == RESPONSE_UNKNOWN {
            return;
        }
        match serde_json::from_str::<Vec<Value>>(param) {
            Ok(changes) => {
                let changes = changes.into_iter().filter(Value::is_object).collect();
                self.change_processor.add_remote_changes(changes);
            }
            Err(e) => warn!("Failed to parse remote changes for {}: {}", self.bucket_name(), e),
        }
    }

    fn handle_object_data(&self, param: &str) {
        let data = match ObjectVersionData::parse(param) {
            Ok(data) => data,
            Err(e) => {
                debug!("Object version for {} unavailable: {}", self.bucket_name(), e);
                self.report_missing_version(param);
                return;
            }
        };

        let indexed = {
            let mut processor = self.index_processor.lock();
            match processor.as_mut() {
                Some(processor) => {
                    if processor.add_object_data(&data) {
                        Some(processor.take_completion())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(completion) = indexed {
            if let Some(change_version) = completion {
                self.index_complete(&change_version);
            }
            return;
        }

        if !self.collect_revision(&data)
            && let Err(e) = self.ctx.bucket.update_ghost(data.to_ghost())
        {
            warn!("Unable to update ghost {}: {}", data.version, e);
        }
    }

    /// Hands the version to waiting revision collectors
    fn collect_revision(&self, data: &ObjectVersionData) -> bool {
        let mut revisions = Vec::new();
        let mut completed = Vec::new();
        {
            let mut collectors = self.collectors.lock();
            collectors.retain_mut(|collector| {
                if !collector.wants(data) {
                    return true;
                }
                let object = self.ctx.bucket.build_object(data.to_ghost());
                collector.add(data.version.version, object);
                revisions.push(Arc::clone(collector.callbacks()));
                if collector.is_complete() {
                    completed.push((Arc::clone(collector.callbacks()), collector.take_revisions()));
                    return false;
                }
                true
            });
        }

        for callbacks in &revisions {
            callbacks.on_revision(data.key(), data.version.version, &data.data);
        }
        for (callbacks, versions) in completed {
            callbacks.on_complete(versions);
        }
        !revisions.is_empty()
    }

    /// An `e:` reply carried no usable data
    fn report_missing_version(&self, param: &str) {
        let prefix = param.split_once('\n').map_or(param, |(prefix, _)| prefix);
        if let Ok(version) = ObjectVersion::parse(prefix) {
            let completion = {
                let mut processor = self.index_processor.lock();
                match processor.as_mut() {
                    Some(processor) => {
                        if processor.skip_version(&version) {
                            processor.take_completion()
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            };
            if let Some(change_version) = completion {
                self.index_complete(&change_version);
            }
        }

        let mut completed = Vec::new();
        {
            let mut collectors = self.collectors.lock();
            collectors.retain_mut(|collector| {
                collector.decrease_expected();
                if collector.is_complete() {
                    completed.push((Arc::clone(collector.callbacks()), collector.take_revisions()));
                    return false;
                }
                true
            });
        }
        for (callbacks, versions) in completed {
            callbacks.on_complete(versions);
        }
    }

    fn handle_version(&self, param: &str) {
        if param == RESPONSE_UNKNOWN {
            info!("Change version of {} is unknown, requesting index", self.bucket_name());
            self.get_latest_versions();
        } else {
            debug!("Ignoring cv message for {}: {}", self.bucket_name(), param);
        }
    }

    fn get_latest_versions(&self) {
        self.ctx.have_index.store(false, Ordering::SeqCst);
        self.ctx.send(IndexQuery::new().to_string());
    }

    fn send_index_status(&self) {
        let bucket = &self.ctx.bucket;
        let status = IndexStatus {
            index: bucket
                .all_objects()
                .iter()
                .map(|object| IndexEntry {
                    id: object.key().to_string(),
                    v: object.version(),
                })
                .collect(),
            current: bucket.get_change_version(),
            pending: self
                .change_processor
                .pending_changes()
                .iter()
                .map(|change| PendingEntry {
                    id: change.key().to_string(),
                    ccid: change.ccid().to_string(),
                })
                .collect(),
            extra: IndexExtra {
                bucket_name: bucket.name().to_string(),
                build: env!("CARGO_PKG_VERSION").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                client: self.library.clone(),
            },
        };
        match serde_json::to_string(&status) {
            Ok(body) => self.ctx.send(command(COMMAND_INDEX_STATE, body)),
            Err(e) => warn!("Unable to build index status: {}", e),
        }
    }
}

impl BucketChannel for Channel {
    fn queue_local_change(&self, key: &str) {
        self.change_processor
            .add_change(Change::modify(self.bucket_name(), key));
    }

    fn queue_local_deletion(&self, key: &str) {
        self.change_processor
            .add_change(Change::remove(self.bucket_name(), key));
    }

    fn log(&self, level: i32, message: &str) {
        self.ctx.log(level, message);
    }

    fn start(&self) {
        self.start_channel();
    }

    fn stop(&self) {
        self.stop_channel();
    }

    fn reset(&self) {
        self.change_processor.reset();
        *self.index_processor.lock() = None;
        self.ctx.log(LOG_DEBUG, "Channel reset");
    }

    fn is_idle(&self) -> bool {
        self.change_processor.is_idle()
    }

    fn get_revisions(&self, key: &str, since_version: u64, max_count: u64, callbacks: Arc<dyn RevisionsCallbacks>) {
        if !self.ctx.is_connected() {
            callbacks.on_error(ClientError::NotConnected);
            return;
        }

        let collector = RevisionsCollector::new(key, since_version, max_count, callbacks);
        let versions = collector.requested_versions();
        if versions.is_empty() {
            collector.callbacks().on_complete(Default::default());
            return;
        }

        self.collectors.lock().push(collector);
        for version in versions {
            self.ctx
                .send(command(COMMAND_ENTITY, ObjectVersion::new(key, version)));
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.ctx.id)
            .field("bucket", &self.bucket_name())
            .field("started", &self.is_started())
            .field("connected", &self.is_connected())
            .finish()
    }
}
