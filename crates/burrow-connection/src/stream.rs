//! Multiplexed stream state

use burrow_proto::StreamId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bound on buffered inbound payloads per stream; a full queue stalls the
/// connection's dispatch, which in turn stalls the reader.
pub const STREAM_BUFFER: usize = 10;

/// Stream lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Open,
    Data,
    Closed,
    Error,
}

/// One logical stream multiplexed on a connection
///
/// Inbound payloads arrive on a bounded queue in frame-arrival order; the
/// close signal is a one-shot broadcast observed by every consumer. Once the
/// signal has fired no further payload is enqueued.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    created_at: DateTime<Utc>,
    state: Mutex<StreamState>,
    metadata: Mutex<HashMap<String, String>>,

    data_tx: mpsc::Sender<Bytes>,
    data_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    close_signal: CancellationToken,
}

impl Stream {
    pub(crate) fn new(id: StreamId) -> Self {
        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(StreamState::Init),
            metadata: Mutex::new(HashMap::new()),
            data_tx,
            data_rx: Mutex::new(Some(data_rx)),
            close_signal: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        self.metadata.lock().unwrap().clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.lock().unwrap().insert(key.into(), value.into());
    }

    /// Take the single consumer end of the inbound queue
    ///
    /// Returns `None` if a consumer already claimed it.
    pub fn take_reader(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.data_rx.lock().unwrap().take()
    }

    /// Token cancelled exactly once, when the stream closes
    pub fn close_signal(&self) -> CancellationToken {
        self.close_signal.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.close_signal.is_cancelled()
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Bytes> {
        &self.data_tx
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != StreamState::Error {
            *state = StreamState::Closed;
        }
        drop(state);
        self.close_signal.cancel();
    }
}
