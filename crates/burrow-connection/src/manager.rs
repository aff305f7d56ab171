//! Connection manager and per-connection frame loop

use crate::connection::Connection;
use crate::errors::ConnectionError;
use crate::stream::StreamState;
use burrow_proto::{read_frame, Frame, FrameError, FrameType, StreamId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inbound frames buffered between the reader task and the dispatch loop
const FRAME_BUFFER: usize = 10;

/// Fired when a connection has fully closed
pub type ConnectionCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Fired when a stream is created or closed on a connection
pub type StreamCallback = Arc<dyn Fn(&str, StreamId) + Send + Sync>;

/// Owns every agent connection and its frame loop
///
/// Callbacks are installed before the acceptor starts handing sockets over;
/// they must not block; the manager calls them inline and never retries.
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,

    max_connections: usize,
    heartbeat_timeout: Duration,
    root_cancel: CancellationToken,

    on_connection_closed: RwLock<Option<ConnectionCallback>>,
    on_stream_created: RwLock<Option<StreamCallback>>,
    on_stream_closed: RwLock<Option<StreamCallback>>,
}

impl ConnectionManager {
    pub fn new(max_connections: usize, heartbeat_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            max_connections,
            heartbeat_timeout,
            root_cancel: CancellationToken::new(),
            on_connection_closed: RwLock::new(None),
            on_stream_created: RwLock::new(None),
            on_stream_closed: RwLock::new(None),
        }
    }

    pub fn set_on_connection_closed(&self, callback: ConnectionCallback) {
        *self.on_connection_closed.write().unwrap() = Some(callback);
    }

    pub fn set_on_stream_created(&self, callback: StreamCallback) {
        *self.on_stream_created.write().unwrap() = Some(callback);
    }

    pub fn set_on_stream_closed(&self, callback: StreamCallback) {
        *self.on_stream_closed.write().unwrap() = Some(callback);
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Register an authenticated socket and start its frame loop
    pub fn register_connection<S>(
        self: &Arc<Self>,
        connection_id: &str,
        agent_id: &str,
        metadata: HashMap<String, String>,
        socket: S,
    ) -> Result<Arc<Connection>, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(socket);

        let conn = {
            let mut connections = self.connections.write().unwrap();

            if self.max_connections > 0 && connections.len() >= self.max_connections {
                return Err(ConnectionError::MaxConnections);
            }
            if connections.contains_key(connection_id) {
                return Err(ConnectionError::ConnectionExists);
            }

            let conn = Arc::new(Connection::new(
                connection_id.to_string(),
                agent_id.to_string(),
                metadata,
                Box::new(write_half),
                self.root_cancel.child_token(),
            ));
            connections.insert(connection_id.to_string(), conn.clone());
            conn
        };

        let manager = self.clone();
        let loop_conn = conn.clone();
        let handle = tokio::spawn(async move {
            manager.run_connection(loop_conn, read_half).await;
        });
        self.tasks.lock().unwrap().insert(connection_id.to_string(), handle);

        info!(connection_id, agent_id, "connection registered");
        Ok(conn)
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().unwrap().get(connection_id).cloned()
    }

    pub fn get_connection_by_agent(&self, agent_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap()
            .values()
            .find(|conn| conn.agent_id() == agent_id)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// Close a connection explicitly
    pub async fn close_connection(&self, connection_id: &str) -> Result<(), ConnectionError> {
        let conn = self
            .get_connection(connection_id)
            .ok_or(ConnectionError::ConnectionNotFound)?;
        self.finish_connection(&conn).await;
        Ok(())
    }

    /// Cancel every connection and wait for all frame loops to finish
    pub async fn drain(&self) {
        self.root_cancel.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, handle)| handle).collect()
        };

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Single cleanup path for every way a connection can die
    ///
    /// The map removal decides which caller runs the callbacks, so they
    /// fire exactly once even when close races the frame loop's own exit.
    async fn finish_connection(&self, conn: &Arc<Connection>) {
        let existed = self
            .connections
            .write()
            .unwrap()
            .remove(conn.id())
            .is_some();

        let closed_streams = conn.close().await;

        if existed {
            for stream_id in closed_streams {
                self.fire_stream_closed(conn.id(), stream_id);
            }
            self.fire_connection_closed(conn.id());
            info!(connection_id = %conn.id(), "connection closed");
        }
    }

    async fn run_connection<R>(self: Arc<Self>, conn: Arc<Connection>, mut reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_BUFFER);
        let (err_tx, mut err_rx) = mpsc::channel::<FrameError>(1);
        let read_cancel = conn.cancel_token().clone();
        let heartbeat_timeout = self.heartbeat_timeout;

        let reader_task = tokio::spawn(async move {
            loop {
                // rolling read deadline: an agent that goes quiet for a full
                // heartbeat interval unblocks the loop here
                let frame = match timeout(heartbeat_timeout, read_frame(&mut reader)).await {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => {
                        let _ = err_tx.send(e).await;
                        return;
                    }
                    Err(_) => {
                        let _ = err_tx
                            .send(FrameError::Io(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "read deadline expired",
                            )))
                            .await;
                        return;
                    }
                };

                tokio::select! {
                    sent = frame_tx.send(frame) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = read_cancel.cancelled() => return,
                }
            }
        });

        let tick = heartbeat_timeout / 2;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);

        loop {
            tokio::select! {
                _ = conn.cancel_token().cancelled() => {
                    debug!(connection_id = %conn.id(), "connection cancelled");
                    break;
                }

                _ = ticker.tick() => {
                    if conn.last_heartbeat().elapsed() > heartbeat_timeout {
                        info!(connection_id = %conn.id(), "heartbeat timeout");
                        break;
                    }
                }

                frame = frame_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = self.dispatch_frame(&conn, frame).await {
                        match e {
                            ConnectionError::ConnectionClosedByAgent => {
                                info!(connection_id = %conn.id(), "agent requested close");
                            }
                            e => {
                                warn!(connection_id = %conn.id(), "fatal protocol error: {}", e);
                            }
                        }
                        break;
                    }
                }

                err = err_rx.recv() => {
                    if let Some(err) = err {
                        debug!(connection_id = %conn.id(), "reader stopped: {}", err);
                    }
                    break;
                }
            }
        }

        self.finish_connection(&conn).await;
        self.tasks.lock().unwrap().remove(conn.id());
        reader_task.abort();
    }

    async fn dispatch_frame(
        &self,
        conn: &Arc<Connection>,
        frame: Frame,
    ) -> Result<(), ConnectionError> {
        if frame.is_control() {
            return self.dispatch_control_frame(conn, frame);
        }
        self.dispatch_stream_frame(conn, frame).await
    }

    fn dispatch_control_frame(
        &self,
        conn: &Arc<Connection>,
        frame: Frame,
    ) -> Result<(), ConnectionError> {
        match frame.frame_type {
            // auth happened during the handshake; a repeat only proves liveness
            FrameType::Auth | FrameType::Heartbeat => {
                conn.touch_heartbeat();
                Ok(())
            }
            FrameType::Close => Err(ConnectionError::ConnectionClosedByAgent),
            other => Err(ConnectionError::InvalidControlFrame(other)),
        }
    }

    async fn dispatch_stream_frame(
        &self,
        conn: &Arc<Connection>,
        frame: Frame,
    ) -> Result<(), ConnectionError> {
        let stream_id = frame.stream_id;

        match frame.frame_type {
            FrameType::OpenStream => {
                conn.create_stream(stream_id)?;
                self.fire_stream_created(conn.id(), stream_id);
                Ok(())
            }

            FrameType::Data => {
                let end_stream = frame.is_end_stream();

                match self.deliver_data(conn, stream_id, frame).await {
                    Ok(()) => {}
                    // losing one stream does not take the connection down
                    Err(
                        e @ (ConnectionError::StreamNotFound(_)
                        | ConnectionError::StreamClosed(_)),
                    ) => {
                        debug!(
                            connection_id = %conn.id(),
                            stream_id,
                            "dropping data frame: {}",
                            e
                        );
                    }
                    Err(e) => return Err(e),
                }

                if end_stream {
                    if conn.close_stream(stream_id).is_some() {
                        self.fire_stream_closed(conn.id(), stream_id);
                    }
                }
                Ok(())
            }

            FrameType::Close => {
                if conn.close_stream(stream_id).is_some() {
                    self.fire_stream_closed(conn.id(), stream_id);
                }
                Ok(())
            }

            other => Err(ConnectionError::InvalidStreamFrame(other)),
        }
    }

    async fn deliver_data(
        &self,
        conn: &Arc<Connection>,
        stream_id: StreamId,
        frame: Frame,
    ) -> Result<(), ConnectionError> {
        let stream = conn
            .get_stream(stream_id)
            .ok_or(ConnectionError::StreamNotFound(stream_id))?;

        if frame.payload.is_empty() {
            return Ok(());
        }

        let close_signal = stream.close_signal();
        tokio::select! {
            sent = stream.sender().send(frame.payload) => {
                if sent.is_err() {
                    return Err(ConnectionError::StreamClosed(stream_id));
                }
                stream.set_state(StreamState::Data);
                Ok(())
            }
            _ = close_signal.cancelled() => Err(ConnectionError::StreamClosed(stream_id)),
            _ = conn.cancel_token().cancelled() => Err(ConnectionError::ConnectionClosed),
        }
    }

    fn fire_connection_closed(&self, connection_id: &str) {
        let callback = self.on_connection_closed.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(connection_id);
        }
    }

    fn fire_stream_created(&self, connection_id: &str, stream_id: StreamId) {
        let callback = self.on_stream_created.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(connection_id, stream_id);
        }
    }

    fn fire_stream_closed(&self, connection_id: &str, stream_id: StreamId) {
        let callback = self.on_stream_closed.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(connection_id, stream_id);
        }
    }
}
