//! Websocket manager
//!
//! Owns the single socket shared by every bucket channel. Channel messages
//! go out as `{channel id}:{message}`; incoming frames are routed back to
//! the channel by the same prefix. `h:N` heartbeats and `log:N` remote log
//! level requests are handled here.

mod connection;

pub use connection::{Connection, ConnectionProvider, WebSocketProvider};

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use simperium_api::protocol::{
    COMMAND_HEARTBEAT, COMMAND_LOG, LOG_DISABLED, LogMessage, channel_frame, heartbeat, split_channel,
    split_command,
};
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::bucket::Bucket;
use crate::channel::{Channel, ChannelEvent};
use crate::config::SimperiumConfig;
use crate::error::{ClientError, Result};
use crate::storage::QueueSerializer;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);
const FAST_RECONNECT_LIMIT: Duration = Duration::from_millis(4000);
const SLOW_RECONNECT_INTERVAL: Duration = Duration::from_millis(15000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnecting,
    Disconnected,
    Connecting,
    Connected,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnecting => "DISCONNECTING",
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
        };
        f.write_str(name)
    }
}

/// Delay before the next reconnect attempt
fn next_reconnect_interval(current: Duration) -> Duration {
    if current < FAST_RECONNECT_LIMIT {
        current + Duration::from_millis(1)
    } else {
        SLOW_RECONNECT_INTERVAL
    }
}

struct ActiveConnection {
    sender: mpsc::UnboundedSender<String>,
    shutdown: Arc<Notify>,
    generation: u64,
}

struct ManagerInner {
    url: Url,
    session_id: String,
    config: SimperiumConfig,
    serializer: Arc<dyn QueueSerializer>,
    provider: Arc<dyn ConnectionProvider>,
    runtime: Handle,
    events: mpsc::UnboundedSender<ChannelEvent>,
    channels: RwLock<Vec<Arc<Channel>>>,
    status: RwLock<ConnectionStatus>,
    connection: Mutex<Option<ActiveConnection>>,
    generation: AtomicU64,
    reconnect: AtomicBool,
    reconnect_interval: Mutex<Duration>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_count: AtomicU64,
    log_level: AtomicI32,
}

/// Connects bucket channels to the sync server
#[derive(Clone)]
pub struct WebSocketManager {
    inner: Arc<ManagerInner>,
}

impl WebSocketManager {
    /// Creates the manager and its dispatch task. Must be called from within
    /// a tokio runtime.
    pub fn new(
        config: SimperiumConfig,
        session_id: &str,
        serializer: Arc<dyn QueueSerializer>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Result<Self> {
        let url = config.websocket_url()?;
        let runtime = Handle::try_current().map_err(|e| ClientError::Other(e.into()))?;
        let (events, receiver) = mpsc::unbounded_channel();

        let inner = Arc::new(ManagerInner {
            url,
            session_id: session_id.to_string(),
            config,
            serializer,
            provider,
            runtime,
            events,
            channels: RwLock::new(Vec::new()),
            status: RwLock::new(ConnectionStatus::Disconnected),
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
            reconnect: AtomicBool::new(true),
            reconnect_interval: Mutex::new(DEFAULT_RECONNECT_INTERVAL),
            reconnect_task: Mutex::new(None),
            heartbeat_count: AtomicU64::new(0),
            log_level: AtomicI32::new(LOG_DISABLED),
        });

        inner
            .runtime
            .spawn(dispatch_channel_events(Arc::downgrade(&inner), receiver));
        Ok(Self { inner })
    }

    /// Creates the channel for `bucket`; connects when the user can sign in.
    pub fn build_channel(&self, bucket: Arc<Bucket>) -> Result<Arc<Channel>> {
        let inner = &self.inner;
        let channel = {
            let mut channels = inner.channels.write();
            let channel = Channel::new(
                channels.len(),
                Arc::clone(&bucket),
                Arc::clone(&inner.serializer),
                inner.events.clone(),
                &inner.config,
                &inner.session_id,
            )?;
            channels.push(Arc::clone(&channel));
            channel
        };
        debug!("Built channel {} for bucket {}", channel.id(), bucket.name());

        if inner.is_connected() {
            channel.on_connect();
        } else if bucket.user().has_access_token() {
            inner.connect();
        }
        Ok(channel)
    }

    pub fn connect(&self) {
        self.inner.connect();
    }

    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.status() == ConnectionStatus::Connecting
    }

    pub fn is_disconnected(&self) -> bool {
        self.status() == ConnectionStatus::Disconnected
    }

    pub fn is_disconnecting(&self) -> bool {
        self.status() == ConnectionStatus::Disconnecting
    }

    /// Remote log level requested by the server
    pub fn log_level(&self) -> i32 {
        self.inner.log_level.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.inner.channels.read().clone()
    }
}

impl ManagerInner {
    fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }

    fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    fn connect(self: &Arc<Self>) {
        self.cancel_reconnect();
        {
            let mut status = self.status.write();
            if matches!(*status, ConnectionStatus::Connected | ConnectionStatus::Connecting)
                || self.channels.read().is_empty()
            {
                return;
            }
            *status = ConnectionStatus::Connecting;
        }
        self.reconnect.store(true, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Connecting to {}", self.url);

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            match inner.provider.connect(&inner.url, &inner.session_id).await {
                Ok(connection) => inner.on_open(generation, connection),
                Err(e) => inner.on_connect_error(e),
            }
        });
    }

    fn disconnect(&self) {
        self.reconnect.store(false, Ordering::SeqCst);
        self.cancel_reconnect();
        if !self.is_connected() {
            return;
        }
        info!("Disconnecting");
        self.set_status(ConnectionStatus::Disconnecting);
        if let Some(connection) = self.connection.lock().take() {
            connection.shutdown.notify_one();
        }
    }

    fn on_open(self: &Arc<Self>, generation: u64, connection: Connection) {
        if !self.reconnect.load(Ordering::SeqCst) {
            debug!("Disconnected while connecting, dropping connection");
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }

        let shutdown = Arc::new(Notify::new());
        *self.connection.lock() = Some(ActiveConnection {
            sender: connection.sender,
            shutdown: Arc::clone(&shutdown),
            generation,
        });
        self.set_status(ConnectionStatus::Connected);
        self.heartbeat_count.store(0, Ordering::SeqCst);
        *self.reconnect_interval.lock() = DEFAULT_RECONNECT_INTERVAL;
        info!("Connected to {}", self.url);

        let channels = self.channels.read().clone();
        for channel in channels {
            channel.on_connect();
        }

        let inner = Arc::clone(self);
        self.runtime
            .spawn(inner.read_frames(generation, connection.receiver, shutdown));
    }

    fn on_connect_error(self: &Arc<Self>, error: ClientError) {
        warn!("Unable to connect to {}: {}", self.url, error);
        self.set_status(ConnectionStatus::Disconnected);
        if self.reconnect.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    async fn read_frames(
        self: Arc<Self>,
        generation: u64,
        mut receiver: mpsc::UnboundedReceiver<String>,
        shutdown: Arc<Notify>,
    ) {
        let heartbeat_interval = self.config.heartbeat_interval();
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                frame = tokio::time::timeout(heartbeat_interval, receiver.recv()) => match frame {
                    Ok(Some(frame)) => self.on_message(&frame),
                    Ok(None) => break,
                    Err(_) => self.send_heartbeat(),
                },
            }
        }
        self.on_close(generation);
    }

    fn on_close(self: &Arc<Self>, generation: u64) {
        {
            let mut connection = self.connection.lock();
            if connection
                .as_ref()
                .is_some_and(|connection| connection.generation != generation)
            {
                return;
            }
            *connection = None;
        }

        info!("Disconnected from {}", self.url);
        self.set_status(ConnectionStatus::Disconnected);
        self.heartbeat_count.store(0, Ordering::SeqCst);
        let channels = self.channels.read().clone();
        for channel in channels {
            channel.on_disconnect();
        }
        if self.reconnect.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn on_message(&self, frame: &str) {
        let (name, param) = split_command(frame);
        match name {
            COMMAND_HEARTBEAT => {
                if let Ok(count) = param.parse::<u64>() {
                    self.heartbeat_count.store(count, Ordering::SeqCst);
                }
            }
            COMMAND_LOG => match param.parse::<i32>() {
                Ok(level) => {
                    debug!("Remote log level set to {}", level);
                    self.log_level.store(level, Ordering::SeqCst);
                }
                Err(_) => warn!("Invalid log level: {}", param),
            },
            _ => {
                let Some((channel_id, message)) = split_channel(frame) else {
                    warn!("Unhandled message {}", name);
                    return;
                };
                let channel = self.channels.read().get(channel_id).cloned();
                match channel {
                    Some(channel) => channel.receive_message(message),
                    None => warn!("Message for unknown channel {}", channel_id),
                }
            }
        }
    }

    fn send(&self, message: String) {
        if !self.is_connected() {
            return;
        }
        if let Some(connection) = self.connection.lock().as_ref()
            && connection.sender.send(message).is_err()
        {
            debug!("Connection closed, message dropped");
        }
    }

    fn send_heartbeat(&self) {
        let count = self.heartbeat_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.send(heartbeat(count));
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut task = self.reconnect_task.lock();
        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let delay = {
            let mut interval = self.reconnect_interval.lock();
            let current = *interval;
            *interval = next_reconnect_interval(current);
            current
        };
        info!("Reconnecting in {} ms", delay.as_millis());

        let inner = Arc::downgrade(self);
        *task = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.reconnect_task.lock().take();
                inner.connect();
            }
        }));
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    fn handle_channel_event(self: &Arc<Self>, event: ChannelEvent) {
        match event {
            ChannelEvent::Message { channel_id, message } => {
                self.send(channel_frame(channel_id, &message));
            }
            ChannelEvent::Log {
                channel_id,
                level,
                message,
            } => {
                let remote_level = self.log_level.load(Ordering::SeqCst);
                if remote_level == LOG_DISABLED || level > remote_level {
                    return;
                }
                let bucket = self
                    .channels
                    .read()
                    .get(channel_id)
                    .map(|channel| channel.bucket_name().to_string())
                    .unwrap_or_default();
                self.send(LogMessage { log: message, bucket }.to_command());
            }
            ChannelEvent::Open(_) => self.connect(),
            ChannelEvent::Close(_) => {
                if self.status() == ConnectionStatus::Disconnected {
                    return;
                }
                if self.channels.read().iter().any(|channel| channel.is_started()) {
                    return;
                }
                debug!("No channel is started, disconnecting");
                self.disconnect();
            }
        }
    }
}

async fn dispatch_channel_events(inner: Weak<ManagerInner>, mut receiver: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_channel_event(event);
    }
    debug!("Channel event dispatch ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_interval() {
        let mut interval = DEFAULT_RECONNECT_INTERVAL;
        interval = next_reconnect_interval(interval);
        assert_eq!(interval, Duration::from_millis(3001));

        interval = next_reconnect_interval(Duration::from_millis(3999));
        assert_eq!(interval, Duration::from_millis(4000));

        interval = next_reconnect_interval(interval);
        assert_eq!(interval, SLOW_RECONNECT_INTERVAL);
        assert_eq!(next_reconnect_interval(interval), SLOW_RECONNECT_INTERVAL);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "CONNECTED");
        assert_eq!(ConnectionStatus::Disconnecting.to_string(), "DISCONNECTING");
    }
}
