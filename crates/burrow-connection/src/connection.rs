//! One authenticated agent connection

use crate::errors::ConnectionError;
use crate::stream::{Stream, StreamState};
use burrow_proto::{write_frame, Frame, StreamId, CONTROL_STREAM_ID};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct StreamTable {
    streams: HashMap<StreamId, Arc<Stream>>,
    next_stream_id: StreamId,
}

/// One agent connection: the socket's write half, the stream table, and the
/// cancellation handle propagated to everything depending on it.
///
/// Outbound frames are serialized through the writer mutex, so at most one
/// task touches the encoder at a time.
pub struct Connection {
    id: String,
    agent_id: String,
    metadata: HashMap<String, String>,
    created_at: DateTime<Utc>,

    last_heartbeat: Mutex<Instant>,
    table: Mutex<StreamTable>,

    closed: AtomicBool,
    cancel: CancellationToken,
    writer: tokio::sync::Mutex<BoxedWriter>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("metadata", &self.metadata)
            .field("created_at", &self.created_at)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: String,
        agent_id: String,
        metadata: HashMap<String, String>,
        writer: BoxedWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            agent_id,
            metadata,
            created_at: Utc::now(),
            last_heartbeat: Mutex::new(Instant::now()),
            table: Mutex::new(StreamTable {
                streams: HashMap::new(),
                // id 0 is the control stream
                next_stream_id: 1,
            }),
            closed: AtomicBool::new(false),
            cancel,
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock().unwrap()
    }

    /// Create the stream table entry for an id chosen by the peer
    pub fn create_stream(&self, stream_id: StreamId) -> Result<Arc<Stream>, ConnectionError> {
        let mut table = self.table.lock().unwrap();
        if table.streams.contains_key(&stream_id) {
            return Err(ConnectionError::StreamExists(stream_id));
        }

        let stream = Arc::new(Stream::new(stream_id));
        stream.set_state(StreamState::Open);
        table.streams.insert(stream_id, stream.clone());
        Ok(stream)
    }

    /// Allocate the next outbound stream id
    ///
    /// Strictly increasing until it wraps at the id width; the control id is
    /// skipped on wrap. A collision with a live stream means ids have lapped
    /// the table, which callers treat as a protocol bug.
    pub fn allocate_stream_id(&self) -> StreamId {
        let mut table = self.table.lock().unwrap();
        Self::next_id(&mut table)
    }

    /// Allocate an id and create its stream in one step (router path)
    pub fn open_stream(&self) -> Result<Arc<Stream>, ConnectionError> {
        let mut table = self.table.lock().unwrap();
        let stream_id = Self::next_id(&mut table);

        if table.streams.contains_key(&stream_id) {
            return Err(ConnectionError::StreamExists(stream_id));
        }

        let stream = Arc::new(Stream::new(stream_id));
        stream.set_state(StreamState::Open);
        table.streams.insert(stream_id, stream.clone());
        Ok(stream)
    }

    fn next_id(table: &mut StreamTable) -> StreamId {
        let stream_id = table.next_stream_id;
        table.next_stream_id = table.next_stream_id.wrapping_add(1);
        if table.next_stream_id == CONTROL_STREAM_ID {
            table.next_stream_id = 1;
        }
        stream_id
    }

    pub fn get_stream(&self, stream_id: StreamId) -> Option<Arc<Stream>> {
        self.table.lock().unwrap().streams.get(&stream_id).cloned()
    }

    pub fn stream_count(&self) -> usize {
        self.table.lock().unwrap().streams.len()
    }

    /// Close one stream and drop it from the table
    ///
    /// Returns the stream if it was still live.
    pub fn close_stream(&self, stream_id: StreamId) -> Option<Arc<Stream>> {
        let stream = self.table.lock().unwrap().streams.remove(&stream_id)?;
        stream.close();
        Some(stream)
    }

    /// Send one frame to the agent
    ///
    /// Writes are serialized by the writer lock; any codec error is fatal
    /// for the connection and surfaces to the caller.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await?;
        Ok(())
    }

    /// Close the connection: idempotent, cancels every dependent operation
    ///
    /// Returns the ids of the streams that were alive at close, so the
    /// owner can run its per-stream notifications.
    pub async fn close(&self) -> Vec<StreamId> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        self.cancel.cancel();

        let streams: Vec<Arc<Stream>> = {
            let mut table = self.table.lock().unwrap();
            table.streams.drain().map(|(_, stream)| stream).collect()
        };

        let mut closed_ids = Vec::with_capacity(streams.len());
        for stream in streams {
            stream.close();
            closed_ids.push(stream.id());
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(connection_id = %self.id, "socket shutdown: {}", e);
        }

        closed_ids
    }
}
