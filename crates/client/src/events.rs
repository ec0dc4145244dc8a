//! Shape-change events over WebSocket
//!
//! The data server pushes a JSON message whenever a watched dataset changes
//! shape:
//!
//! ```json
//! {"name": "image", "filePath": "/data/scan.h5", "shape": [1801, 2048, 2048]}
//! ```
//!
//! [`ShapeTracker`] reconciles those events into the shared descriptor. With
//! dynamic shape on (the default) an event resizes the descriptor and notifies
//! listeners right away; with it off the newest shape is staged and applied
//! once dynamic shape is turned back on.
//!
//! [`EventChannel`] owns the socket. It greets the server with
//! `Connected to <path>` and says `Disconnected from <path>` on close. There
//! is no automatic reconnect; [`EventChannel::is_open`] reports a lost
//! connection.

use crate::descriptor::{DatasetDescriptor, UNBOUNDED};
use crate::error::{Error, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How long `close` waits for the farewell to be flushed
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shape-change notification pushed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeEvent {
    /// Dataset name
    #[serde(default)]
    pub name: Option<String>,
    /// File the dataset lives in
    #[serde(default)]
    pub file_path: Option<String>,
    /// New shape; events without one are ignored
    #[serde(default)]
    pub shape: Option<Vec<i64>>,
}

impl ShapeEvent {
    /// Event carrying only a shape
    pub fn new(shape: Vec<i64>) -> Self {
        Self {
            name: None,
            file_path: None,
            shape: Some(shape),
        }
    }

    /// Decode one text message
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("Invalid shape event '{}': {}", text, e)))
    }

    /// Encode as the server sends it
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Receives the new shape after it has been applied to the descriptor
///
/// Called on the event channel's receiver task. Listeners must not call back
/// into [`ShapeTracker::set_dynamic_shape`] or register listeners from inside
/// the callback.
pub trait ShapeListener: Send + Sync {
    fn on_shape_changed(&self, shape: &[i64]);
}

impl<F> ShapeListener for F
where
    F: Fn(&[i64]) + Send + Sync,
{
    fn on_shape_changed(&self, shape: &[i64]) {
        self(shape)
    }
}

#[derive(Debug)]
struct Reconcile {
    dynamic: bool,
    pending: Option<Vec<i64>>,
}

/// Shared shape state of one dataset
///
/// Event application and `set_dynamic_shape` are serialized by one lock, so
/// listeners see shapes in the order they were applied. The descriptor sits
/// behind its own lock and may be read from inside a listener.
pub struct ShapeTracker {
    descriptor: RwLock<DatasetDescriptor>,
    reconcile: Mutex<Reconcile>,
    listeners: RwLock<Vec<Arc<dyn ShapeListener>>>,
}

impl ShapeTracker {
    /// Track `descriptor` with dynamic shape on
    pub fn new(descriptor: DatasetDescriptor) -> Self {
        Self {
            descriptor: RwLock::new(descriptor),
            reconcile: Mutex::new(Reconcile {
                dynamic: true,
                pending: None,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Copy of the current descriptor
    pub fn descriptor(&self) -> DatasetDescriptor {
        self.descriptor.read().clone()
    }

    /// Read the descriptor in place
    pub fn with_descriptor<R>(&self, f: impl FnOnce(&DatasetDescriptor) -> R) -> R {
        f(&self.descriptor.read())
    }

    /// Replace the descriptor after a fresh metadata fetch
    ///
    /// Any staged shape belonged to the previous descriptor and is discarded.
    pub fn reset(&self, descriptor: DatasetDescriptor) {
        let mut reconcile = self.reconcile.lock();
        reconcile.pending = None;
        *self.descriptor.write() = descriptor;
    }

    /// Current shape
    pub fn shape(&self) -> Vec<i64> {
        self.descriptor.read().shape.clone()
    }

    /// Whether events resize the descriptor immediately
    pub fn is_dynamic_shape(&self) -> bool {
        self.reconcile.lock().dynamic
    }

    /// Shape staged while dynamic shape was off
    pub fn pending_shape(&self) -> Option<Vec<i64>> {
        self.reconcile.lock().pending.clone()
    }

    /// Turn dynamic shape on or off
    ///
    /// Turning it on applies the staged shape, if any, exactly once.
    pub fn set_dynamic_shape(&self, dynamic: bool) {
        let mut reconcile = self.reconcile.lock();
        reconcile.dynamic = dynamic;
        if dynamic {
            if let Some(shape) = reconcile.pending.take() {
                if !shape.is_empty() {
                    debug!("Applying staged shape {:?}", shape);
                    self.apply_shape(shape);
                }
            }
        }
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn ShapeListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener by identity; returns whether it was registered
    pub fn remove_listener(&self, listener: &Arc<dyn ShapeListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| Arc::as_ptr(registered) as *const () != target);
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Handle one raw text message from the event channel
    ///
    /// Malformed messages are logged and discarded.
    pub fn handle_message(&self, text: &str) {
        match ShapeEvent::decode(text) {
            Ok(event) => self.apply_event(event),
            Err(e) => warn!("Discarding event message: {}", e),
        }
    }

    /// Reconcile a decoded event
    pub fn apply_event(&self, event: ShapeEvent) {
        let Some(shape) = event.shape else {
            debug!("Ignoring event without shape for {:?}", event.file_path);
            return;
        };
        let mut reconcile = self.reconcile.lock();
        if let Err(e) = self.check_shape(&shape) {
            warn!("Discarding shape event: {}", e);
            return;
        }

        if reconcile.dynamic {
            self.apply_shape(shape);
        } else {
            debug!("Staging shape {:?}", shape);
            reconcile.pending = Some(shape);
        }
    }

    // Caller holds the reconcile lock
    fn check_shape(&self, shape: &[i64]) -> Result<()> {
        let descriptor = self.descriptor.read();
        let rank = descriptor.rank();
        if !descriptor.rank_unset && shape.len() != rank {
            return Err(Error::protocol(format!(
                "shape {:?} has rank {}, dataset has rank {}",
                shape,
                shape.len(),
                rank
            )));
        }
        if shape.iter().any(|&dim| dim < 0 && dim != UNBOUNDED) {
            return Err(Error::protocol(format!("shape {:?} has negative dimensions", shape)));
        }
        Ok(())
    }

    // Caller holds the reconcile lock
    fn apply_shape(&self, shape: Vec<i64>) {
        self.descriptor.write().resize(shape.clone());
        info!("Dataset shape changed to {:?}", shape);

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_shape_changed(&shape);
        }
    }
}

impl std::fmt::Debug for ShapeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeTracker")
            .field("descriptor", &*self.descriptor.read())
            .field("reconcile", &*self.reconcile.lock())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Open WebSocket subscription to shape events for one path
pub struct EventChannel {
    url: Url,
    path: String,
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    closed: bool,
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl EventChannel {
    /// Connect, greet the server and start feeding `tracker`
    pub async fn connect(url: &Url, path: &str, tracker: Arc<ShapeTracker>) -> Result<Self> {
        info!("Connecting to event channel: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(format!("Failed to connect to {}: {}", url, e)))?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let sender = tokio::spawn(Self::sender_task(write, rx, Arc::clone(&open)));
        let receiver = tokio::spawn(Self::receiver_task(read, tracker, Arc::clone(&open)));

        let channel = Self {
            url: url.clone(),
            path: path.to_string(),
            tx,
            open,
            closed: false,
            sender,
            receiver,
        };
        channel.send_text(format!("Connected to {}", channel.path))?;
        info!("Event channel open for {}", channel.path);
        Ok(channel)
    }

    /// Whether the socket is still connected
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Event endpoint this channel is connected to
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Say goodbye and close the socket
    ///
    /// Safe to call on an already closed channel.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.is_open() {
            let farewell = format!("Disconnected from {}", self.path);
            // A dead sender task means the socket is already gone
            if self.send_text(farewell).is_ok() {
                let _ = self.tx.send(Message::Close(None));
            }
        }
        self.open.store(false, Ordering::Release);

        if tokio::time::timeout(CLOSE_TIMEOUT, &mut self.sender).await.is_err() {
            warn!("Event channel for {} did not close in time", self.path);
            self.sender.abort();
        }
        self.receiver.abort();
        info!("Event channel closed for {}", self.path);
        Ok(())
    }

    fn send_text(&self, text: String) -> Result<()> {
        debug!("Sending event channel message: {}", text);
        self.tx
            .send(Message::Text(text))
            .map_err(|e| Error::WebSocket(format!("Failed to send message: {}", e)))
    }

    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        open: Arc<AtomicBool>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                open.store(false, Ordering::Release);
                break;
            }
            if closing {
                break;
            }
        }

        debug!("Event sender task terminated");
    }

    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tracker: Arc<ShapeTracker>,
        open: Arc<AtomicBool>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => tracker.handle_message(&text),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => tracker.handle_message(text),
                    Err(_) => warn!("Discarding binary event message of {} bytes", data.len()),
                },
                Ok(Message::Close(_)) => {
                    info!("Event channel closed by server");
                    break;
                }
                Err(e) => {
                    error!("Event channel error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        open.store(false, Ordering::Release);
        debug!("Event receiver task terminated");
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.sender.abort();
        self.receiver.abort();
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("url", &self.url.as_str())
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}
