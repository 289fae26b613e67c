//! Protocol client sessions
//!
//! A [`Session`] owns one transport to one server. Requests are tagged with a
//! monotonically increasing id and parked in a pending table until the
//! background reader routes the matching response back. Responses may arrive
//! in any order. Frames that do not parse are ignored so that a server
//! printing noise to stdout cannot take the session down.
//!
//! Outgoing frames go through a queue drained by a dedicated writer task, so
//! the reader never waits on a stalled write while answering the server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{ProtocolError, ProtocolResult};
use super::transport::{BoxedReader, Connection, FrameReader, FrameWriter, ServerConfig};
use super::ToolCaller;
use crate::domain::mcp_types::{
    methods, CallToolParams, Implementation, IncomingMessage, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListToolsResult, METHOD_NOT_FOUND,
    PROTOCOL_VERSION,
};
use crate::domain::{CallToolResult, Prompt, Resource, ToolSpec};

/// Default time a request may wait for its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// How long `disconnect` waits for queued frames to be flushed.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

struct PendingRequest {
    method: String,
    sent_at: Instant,
    tx: oneshot::Sender<ProtocolResult<Value>>,
}

/// Requests awaiting responses. Once `closed` is set no new entry may be
/// inserted, so nothing can be orphaned by a concurrent shutdown.
#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    closed: Option<ProtocolError>,
}

struct SessionShared {
    server_id: String,
    /// Dropped on close, which lets the writer task flush and shut down.
    outgoing: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    pending: Mutex<PendingTable>,
    tools: RwLock<Vec<ToolSpec>>,
    closed_tx: watch::Sender<bool>,
}

impl SessionShared {
    /// Mark the session closed and reject every pending request with `reason`.
    /// Returns false when the session was already closed.
    fn close(&self, reason: ProtocolError) -> bool {
        let drained: Vec<PendingRequest> = {
            let mut table = match self.pending.lock() {
                Ok(table) => table,
                Err(poisoned) => poisoned.into_inner(),
            };
            if table.closed.is_some() {
                return false;
            }
            table.closed = Some(reason.clone());
            table.entries.drain().map(|(_, pending)| pending).collect()
        };
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.take();
        }

        if !drained.is_empty() {
            debug!(
                "Rejecting {} pending request(s) on '{}': {}",
                drained.len(),
                self.server_id,
                reason
            );
        }
        for pending in drained {
            let _ = pending.tx.send(Err(reason.clone()));
        }
        self.closed_tx.send_replace(true);
        true
    }

    /// Queue one frame for the writer task.
    fn send<T: serde::Serialize>(&self, message: &T) -> ProtocolResult<()> {
        let value = serde_json::to_value(message)?;
        let outgoing = self
            .outgoing
            .lock()
            .map_err(|_| ProtocolError::Transport("writer queue poisoned".to_string()))?;
        match outgoing.as_ref() {
            Some(tx) => tx.send(value).map_err(|_| self.closed_reason()),
            None => Err(self.closed_reason()),
        }
    }

    fn closed_reason(&self) -> ProtocolError {
        self.pending
            .lock()
            .ok()
            .and_then(|table| table.closed.clone())
            .unwrap_or_else(|| {
                ProtocolError::Transport(format!("writer for '{}' has stopped", self.server_id))
            })
    }

    fn take_pending(&self, id: u64) -> Option<PendingRequest> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut table| table.entries.remove(&id))
    }

    fn dispatch(&self, frame: &[u8]) {
        let message = match IncomingMessage::parse(frame) {
            Some(message) => message,
            None => {
                debug!(
                    "Ignoring non-protocol output from '{}' ({} bytes)",
                    self.server_id,
                    frame.len()
                );
                return;
            }
        };

        match message {
            IncomingMessage::Response { id, outcome } => {
                let pending = id.as_u64().and_then(|id| self.take_pending(id));
                match pending {
                    Some(pending) => {
                        debug!(
                            "Response for {} #{} from '{}' after {:?}",
                            pending.method,
                            id,
                            self.server_id,
                            pending.sent_at.elapsed()
                        );
                        let result = outcome.map_err(|err| ProtocolError::Application {
                            code: err.code,
                            message: err.message,
                        });
                        let _ = pending.tx.send(result);
                    }
                    None => warn!(
                        "Received response with unknown id {} from '{}'",
                        id, self.server_id
                    ),
                }
            }
            IncomingMessage::Notification { method, params } => {
                if method == methods::NOTIFY_TOOLS {
                    match params.map(serde_json::from_value::<ListToolsResult>) {
                        Some(Ok(listing)) => {
                            debug!(
                                "'{}' pushed {} tool(s)",
                                self.server_id,
                                listing.tools.len()
                            );
                            if let Ok(mut tools) = self.tools.write() {
                                *tools = listing.tools;
                            }
                        }
                        _ => warn!("Malformed tools notification from '{}'", self.server_id),
                    }
                } else {
                    debug!("Unhandled notification '{}' from '{}'", method, self.server_id);
                }
            }
            IncomingMessage::Request { id, method, .. } => {
                debug!(
                    "Declining server-initiated request '{}' from '{}'",
                    method, self.server_id
                );
                let response = JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", method)),
                );
                if let Err(e) = self.send(&response) {
                    warn!("Failed to answer '{}' on '{}': {}", method, self.server_id, e);
                }
            }
        }
    }
}

async fn read_loop(shared: Arc<SessionShared>, mut frames: FrameReader<BoxedReader>) {
    loop {
        match frames.next_frame().await {
            Ok(Some(frame)) => shared.dispatch(&frame),
            Ok(None) => {
                if shared.close(ProtocolError::Transport(format!(
                    "connection to '{}' closed",
                    shared.server_id
                ))) {
                    info!("Server '{}' closed its connection", shared.server_id);
                }
                break;
            }
            Err(e) => {
                if shared.close(ProtocolError::Transport(e.to_string())) {
                    warn!("Read error on '{}': {}", shared.server_id, e);
                }
                break;
            }
        }
    }
}

async fn write_loop(
    shared: Arc<SessionShared>,
    mut frames: FrameWriter,
    mut outgoing: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(message) = outgoing.recv().await {
        if let Err(e) = frames.write_frame(&message).await {
            if shared.close(ProtocolError::Transport(e.to_string())) {
                warn!("Write error on '{}': {}", shared.server_id, e);
            }
            break;
        }
    }
    frames.shutdown().await;
}

/// A live, initialized connection to one protocol server
pub struct Session {
    shared: Arc<SessionShared>,
    next_id: AtomicU64,
    call_timeout: Duration,
    server_info: Option<InitializeResult>,
    child: AsyncMutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Open the configured transport and perform the handshake.
    pub async fn connect(config: &ServerConfig) -> ProtocolResult<Self> {
        let connection = Connection::open(&config.transport).await?;
        Self::establish(&config.id, connection, config.call_timeout).await
    }

    /// Handshake over an already-open connection.
    ///
    /// Resolves only after `initialize` has been answered and the initial
    /// tool listing has been received. On failure the transport is torn down.
    pub async fn establish(
        server_id: &str,
        connection: Connection,
        call_timeout: Duration,
    ) -> ProtocolResult<Self> {
        let Connection {
            reader,
            writer,
            child,
        } = connection;

        let (closed_tx, _) = watch::channel(false);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            server_id: server_id.to_string(),
            outgoing: Mutex::new(Some(outgoing_tx)),
            pending: Mutex::new(PendingTable::default()),
            tools: RwLock::new(Vec::new()),
            closed_tx,
        });
        let reader_task = tokio::spawn(read_loop(shared.clone(), FrameReader::new(reader)));
        let writer_task = tokio::spawn(write_loop(
            shared.clone(),
            FrameWriter::new(writer),
            outgoing_rx,
        ));

        let mut session = Self {
            shared,
            next_id: AtomicU64::new(1),
            call_timeout,
            server_info: None,
            child: AsyncMutex::new(child),
            reader: Mutex::new(Some(reader_task)),
            writer: Mutex::new(Some(writer_task)),
        };

        match session.handshake().await {
            Ok(info) => {
                session.server_info = info;
                info!(
                    "Connected to '{}' with {} tool(s)",
                    server_id,
                    session.tools().len()
                );
                Ok(session)
            }
            Err(e) => {
                warn!("Handshake with '{}' failed: {}", server_id, e);
                session.disconnect().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> ProtocolResult<Option<InitializeResult>> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self
            .request(methods::INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;
        let info = match serde_json::from_value::<InitializeResult>(result) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("Unrecognized initialize result from '{}': {}", self.server_id(), e);
                None
            }
        };

        self.notify(methods::NOTIFY_INITIALIZED, None)?;
        self.list_tools().await?;
        Ok(info)
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.as_ref()
    }

    /// Most recently advertised tools.
    pub fn tools(&self) -> Vec<ToolSpec> {
        self.shared
            .tools
            .read()
            .map(|tools| tools.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// Resolves once the transport has closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .map(|table| table.entries.len())
            .unwrap_or(0)
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> ProtocolResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self
                .shared
                .pending
                .lock()
                .map_err(|_| ProtocolError::Transport("pending table poisoned".to_string()))?;
            if let Some(reason) = &table.closed {
                return Err(reason.clone());
            }
            table.entries.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    sent_at: Instant::now(),
                    tx,
                },
            );
        }

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.shared.send(&request) {
            self.shared.take_pending(id);
            return Err(e);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::Transport(format!(
                "response channel for {} #{} dropped",
                method, id
            ))),
            Err(_) => {
                self.shared.take_pending(id);
                warn!(
                    "{} #{} to '{}' timed out after {:?}",
                    method,
                    id,
                    self.server_id(),
                    self.call_timeout
                );
                Err(ProtocolError::Timeout(self.call_timeout))
            }
        }
    }

    fn notify(&self, method: &str, params: Option<Value>) -> ProtocolResult<()> {
        let notification = JsonRpcRequest::notification(method, params);
        self.shared.send(&notification)
    }

    /// Re-fetch the tool listing from the server.
    pub async fn list_tools(&self) -> ProtocolResult<Vec<ToolSpec>> {
        let result = self.request(methods::TOOLS_LIST, None).await?;
        let listing: ListToolsResult = serde_json::from_value(result)?;
        if let Ok(mut tools) = self.shared.tools.write() {
            *tools = listing.tools.clone();
        }
        Ok(listing.tools)
    }

    pub async fn list_resources(&self) -> ProtocolResult<Vec<Resource>> {
        let result = self.request(methods::RESOURCES_LIST, None).await?;
        let resources = result.get("resources").cloned().unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(resources)?)
    }

    pub async fn list_prompts(&self) -> ProtocolResult<Vec<Prompt>> {
        let result = self.request(methods::PROMPTS_LIST, None).await?;
        let prompts = result.get("prompts").cloned().unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(prompts)?)
    }

    pub async fn ping(&self) -> ProtocolResult<()> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> ProtocolResult<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .request(methods::TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Close the session. Pending requests are rejected as cancelled, the
    /// owned process is killed. Safe to call more than once.
    pub async fn disconnect(&self) {
        let first = self.shared.close(ProtocolError::Cancelled(format!(
            "session '{}' disconnected",
            self.server_id()
        )));

        let reader = self.reader.lock().ok().and_then(|mut handle| handle.take());
        if let Some(handle) = reader {
            handle.abort();
        }

        let writer = self.writer.lock().ok().and_then(|mut handle| handle.take());
        if let Some(handle) = writer {
            let abort = handle.abort_handle();
            if tokio::time::timeout(WRITER_DRAIN, handle).await.is_err() {
                debug!("Writer for '{}' did not drain, aborting", self.server_id());
                abort.abort();
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("Process for '{}' already gone: {}", self.server_id(), e);
            }
        }

        if first {
            info!("Disconnected from '{}'", self.server_id());
        }
    }
}

#[async_trait]
impl ToolCaller for Session {
    fn server_id(&self) -> &str {
        Session::server_id(self)
    }

    fn tools(&self) -> Vec<ToolSpec> {
        Session::tools(self)
    }

    fn is_closed(&self) -> bool {
        Session::is_closed(self)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> ProtocolResult<CallToolResult> {
        Session::call_tool(self, name, arguments).await
    }

    async fn closed(&self) {
        Session::closed(self).await
    }

    async fn disconnect(&self) {
        Session::disconnect(self).await
    }
}

/// Registry of tool-server sessions keyed by server id
pub struct McpClientManager {
    sessions: AsyncRwLock<HashMap<String, Arc<dyn ToolCaller>>>,
}

impl McpClientManager {
    pub fn new() -> Self {
        Self {
            sessions: AsyncRwLock::new(HashMap::new()),
        }
    }

    /// Connect to a server and register the session under its id. A session
    /// already registered under that id is disconnected first.
    pub async fn connect(&self, config: &ServerConfig) -> ProtocolResult<Arc<dyn ToolCaller>> {
        let session: Arc<dyn ToolCaller> = Arc::new(Session::connect(config).await?);
        self.register(config.id.clone(), session.clone()).await;
        Ok(session)
    }

    /// Register a session established elsewhere.
    pub async fn register(&self, server_id: impl Into<String>, session: Arc<dyn ToolCaller>) {
        let server_id = server_id.into();
        let previous = self.sessions.write().await.insert(server_id.clone(), session);
        if let Some(previous) = previous {
            debug!("Replacing session for '{}'", server_id);
            previous.disconnect().await;
        }
    }

    pub async fn get(&self, server_id: &str) -> Option<Arc<dyn ToolCaller>> {
        self.sessions.read().await.get(server_id).cloned()
    }

    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Cached tool listing for a server.
    pub async fn list_tools(&self, server_id: &str) -> ProtocolResult<Vec<ToolSpec>> {
        self.get(server_id)
            .await
            .map(|session| session.tools())
            .ok_or_else(|| ProtocolError::SessionNotFound(server_id.to_string()))
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> ProtocolResult<CallToolResult> {
        let session = self
            .get(server_id)
            .await
            .ok_or_else(|| ProtocolError::SessionNotFound(server_id.to_string()))?;
        session.call_tool(name, arguments).await
    }

    /// Disconnect and forget a session. Unknown ids are ignored.
    pub async fn disconnect(&self, server_id: &str) {
        let removed = self.sessions.write().await.remove(server_id);
        if let Some(session) = removed {
            session.disconnect().await;
        }
    }

    /// Disconnect every session concurrently and clear the registry.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Arc<dyn ToolCaller>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        join_all(sessions.iter().map(|s| s.disconnect())).await;
    }
}

impl Default for McpClientManager {
    fn default() -> Self {
        Self::new()
    }
}
