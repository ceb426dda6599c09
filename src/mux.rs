//! # Stream Multiplexing
//!
//! Splits one sealed byte channel into independent, ordered, bidirectional
//! streams. Every plaintext frame carries a 5-byte header:
//!
//! ```text
//! stream id (u32 BE) | kind (u8) | payload
//! ```
//!
//! | kind | payload                |
//! |------|------------------------|
//! | OPEN | empty                  |
//! | DATA | bytes                  |
//! | WNDU | credit (u32 BE)        |
//! | FIN  | empty                  |
//! | RST  | empty                  |
//! | AWAY | empty (stream id 0)    |
//!
//! ## Flow Control
//!
//! Each direction of each stream starts with [`INITIAL_WINDOW`] bytes of credit.
//! A writer acquires credit from a per-stream semaphore *before* queueing data,
//! so a stream whose reader has stalled parks only its own writer and never the
//! shared outbound queue. Readers return credit in [`WINDOW_UPDATE_THRESHOLD`]
//! sized batches as the application consumes bytes. Data beyond the granted
//! window resets the stream.
//!
//! ## Lifecycle
//!
//! A connection runs a reader task and a writer task. When either side of the
//! socket fails, or [`Connection::close`] is called, the stream table is torn
//! down: pending writes fail with [`StreamError::ConnectionClosed`] and reads
//! fail the same way once buffered data (and a FIN, if one arrived) is drained.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, trace};

use crate::crypto::{FrameOpener, FrameSealer, SessionKeys, TAG_LEN};
use crate::identity::PeerId;

/// Per-stream receive window granted to the remote writer.
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Credit is returned once this many bytes have been consumed.
pub const WINDOW_UPDATE_THRESHOLD: u32 = INITIAL_WINDOW / 2;

/// Largest DATA payload per frame.
pub const MAX_DATA_FRAME: usize = 16 * 1024;

const HEADER_LEN: usize = 5;

/// Upper bound on a sealed frame read from the socket.
const MAX_SEALED_FRAME: usize = HEADER_LEN + MAX_DATA_FRAME + TAG_LEN;

const OUTBOUND_QUEUE_DEPTH: usize = 256;

const MAX_PENDING_INBOUND_STREAMS: usize = 64;

const MAX_STREAMS_PER_CONNECTION: usize = 512;

const KIND_OPEN: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_WINDOW_UPDATE: u8 = 2;
const KIND_FIN: u8 = 3;
const KIND_RESET: u8 = 4;
const KIND_GO_AWAY: u8 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("stream reset")]
    Reset,
    #[error("stream already finished")]
    Finished,
    #[error("stream ended before the expected number of bytes")]
    UnexpectedEof,
    #[error("stream data exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("too many open streams")]
    TooManyStreams,
}

#[derive(Debug, Error)]
enum FrameError {
    #[error("frame shorter than header")]
    Truncated,
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("sealed frame of {0} bytes exceeds limit")]
    Oversized(usize),
    #[error("bad window update payload")]
    BadWindowUpdate,
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Open { stream: u32 },
    Data { stream: u32, payload: Vec<u8> },
    WindowUpdate { stream: u32, credit: u32 },
    Fin { stream: u32 },
    Reset { stream: u32 },
    GoAway,
}

impl Frame {
    fn encode(&self) -> Vec<u8> {
        let (stream, kind, payload): (u32, u8, &[u8]) = match self {
            Frame::Open { stream } => (*stream, KIND_OPEN, &[]),
            Frame::Data { stream, payload } => (*stream, KIND_DATA, payload),
            Frame::WindowUpdate { stream, .. } => (*stream, KIND_WINDOW_UPDATE, &[]),
            Frame::Fin { stream } => (*stream, KIND_FIN, &[]),
            Frame::Reset { stream } => (*stream, KIND_RESET, &[]),
            Frame::GoAway => (0, KIND_GO_AWAY, &[]),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
        out.extend_from_slice(&stream.to_be_bytes());
        out.push(kind);
        if let Frame::WindowUpdate { credit, .. } = self {
            out.extend_from_slice(&credit.to_be_bytes());
        } else {
            out.extend_from_slice(payload);
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let stream = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let payload = &bytes[HEADER_LEN..];
        match bytes[4] {
            KIND_OPEN => Ok(Frame::Open { stream }),
            KIND_DATA => Ok(Frame::Data {
                stream,
                payload: payload.to_vec(),
            }),
            KIND_WINDOW_UPDATE => {
                let credit: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| FrameError::BadWindowUpdate)?;
                Ok(Frame::WindowUpdate {
                    stream,
                    credit: u32::from_be_bytes(credit),
                })
            }
            KIND_FIN => Ok(Frame::Fin { stream }),
            KIND_RESET => Ok(Frame::Reset { stream }),
            KIND_GO_AWAY => Ok(Frame::GoAway),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// We dialed; our streams use odd ids.
    Outbound,
    /// We accepted; our streams use even ids.
    Inbound,
}

enum StreamEvent {
    Data(Vec<u8>),
    Fin,
    Reset,
}

struct StreamSlot {
    events: mpsc::UnboundedSender<StreamEvent>,
    send_credit: Arc<Semaphore>,
    /// Bytes the remote may still send before we grant more.
    recv_window: u32,
    send_done: bool,
    recv_done: bool,
}

struct StreamTable {
    next_local_id: u32,
    slots: HashMap<u32, StreamSlot>,
    closed: bool,
}

struct Shared {
    id: u64,
    remote_peer: PeerId,
    remote_addr: SocketAddr,
    direction: Direction,
    established_at: Instant,
    outbound: mpsc::Sender<Frame>,
    table: Mutex<StreamTable>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<(SendStream, RecvStream)>>,
    closed: watch::Sender<bool>,
    close_reason: Mutex<Option<String>>,
}

/// An authenticated, encrypted, multiplexed connection to one remote peer.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("remote_peer", &self.shared.remote_peer)
            .field("remote_addr", &self.shared.remote_addr)
            .field("direction", &self.shared.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Start the reader and writer tasks for a handshaken socket.
    pub(crate) fn spawn<R, W>(
        reader: R,
        writer: W,
        keys: SessionKeys,
        remote_peer: PeerId,
        remote_addr: SocketAddr,
        direction: Direction,
        id: u64,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sealer, opener) = keys.split();
        drop(keys);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (incoming_tx, incoming_rx) = mpsc::channel(MAX_PENDING_INBOUND_STREAMS);
        let (closed_tx, _) = watch::channel(false);

        let first_local_id = match direction {
            Direction::Outbound => 1,
            Direction::Inbound => 2,
        };

        let shared = Arc::new(Shared {
            id,
            remote_peer,
            remote_addr,
            direction,
            established_at: Instant::now(),
            outbound: outbound_tx,
            table: Mutex::new(StreamTable {
                next_local_id: first_local_id,
                slots: HashMap::new(),
                closed: false,
            }),
            incoming: tokio::sync::Mutex::new(incoming_rx),
            closed: closed_tx,
            close_reason: Mutex::new(None),
        });

        tokio::spawn(write_loop(writer, sealer, outbound_rx, shared.clone()));
        tokio::spawn(read_loop(reader, opener, shared.clone(), incoming_tx));

        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn remote_peer(&self) -> PeerId {
        self.shared.remote_peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn established_at(&self) -> Instant {
        self.shared.established_at
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.shared
            .close_reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
    }

    pub fn stream_count(&self) -> usize {
        self.shared
            .table
            .lock()
            .map(|t| t.slots.len())
            .unwrap_or(0)
    }

    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), StreamError> {
        let (id, pair) = {
            let mut table = self
                .shared
                .table
                .lock()
                .map_err(|_| StreamError::ConnectionClosed)?;
            if table.closed {
                return Err(StreamError::ConnectionClosed);
            }
            if table.slots.len() >= MAX_STREAMS_PER_CONNECTION {
                return Err(StreamError::TooManyStreams);
            }
            let id = table.next_local_id;
            table.next_local_id = id.checked_add(2).ok_or(StreamError::TooManyStreams)?;
            let pair = register_stream(&self.shared, &mut table, id);
            (id, pair)
        };
        self.shared.send(Frame::Open { stream: id }).await?;
        trace!(conn = self.shared.id, stream = id, "opened stream");
        Ok(pair)
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), StreamError> {
        let mut incoming = self.shared.incoming.lock().await;
        incoming.recv().await.ok_or(StreamError::ConnectionClosed)
    }

    /// Send GO_AWAY and tear the connection down.
    pub fn close(&self) {
        self.shared.try_send(Frame::GoAway);
        self.shared.mark_closed("closed locally");
    }

    /// Resolves once the connection is closed for any reason.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

fn register_stream(shared: &Arc<Shared>, table: &mut StreamTable, id: u32) -> (SendStream, RecvStream) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let credit = Arc::new(Semaphore::new(INITIAL_WINDOW as usize));
    table.slots.insert(
        id,
        StreamSlot {
            events: events_tx,
            send_credit: credit.clone(),
            recv_window: INITIAL_WINDOW,
            send_done: false,
            recv_done: false,
        },
    );
    (
        SendStream {
            id,
            shared: shared.clone(),
            credit,
            finished: false,
        },
        RecvStream {
            id,
            shared: shared.clone(),
            events: events_rx,
            pending: Vec::new(),
            offset: 0,
            eof: false,
            unacked: 0,
        },
    )
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn send(&self, frame: Frame) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| StreamError::ConnectionClosed)
    }

    /// Queue a control frame from a synchronous context (drop, close).
    fn try_send(&self, frame: Frame) {
        if self.is_closed() {
            return;
        }
        match self.outbound.try_send(frame) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => match tokio::runtime::Handle::try_current() {
                // Waits behind frames already queued, so stream order holds.
                Ok(handle) => {
                    let outbound = self.outbound.clone();
                    handle.spawn(async move {
                        let _ = outbound.send(frame).await;
                    });
                }
                Err(_) => debug!(conn = self.id, ?frame, "outbound queue full, control frame dropped"),
            },
        }
    }

    fn mark_closed(&self, reason: &str) {
        let already = self.closed.send_replace(true);
        if let Ok(mut table) = self.table.lock() {
            table.closed = true;
            for (_, slot) in table.slots.drain() {
                slot.send_credit.close();
            }
        }
        if !already {
            if let Ok(mut r) = self.close_reason.lock() {
                *r = Some(reason.to_string());
            }
            debug!(
                conn = self.id,
                peer = ?self.remote_peer,
                addr = %self.remote_addr,
                reason,
                "connection closed"
            );
        }
    }

    fn release(&self, id: u32, send_side: bool) {
        if let Ok(mut table) = self.table.lock() {
            let remove = match table.slots.get_mut(&id) {
                Some(slot) => {
                    if send_side {
                        slot.send_done = true;
                    } else {
                        slot.recv_done = true;
                    }
                    slot.send_done && slot.recv_done
                }
                None => false,
            };
            if remove {
                table.slots.remove(&id);
            }
        }
    }

    fn grant(&self, id: u32, credit: u32) -> bool {
        match self.table.lock() {
            Ok(mut table) => match table.slots.get_mut(&id) {
                Some(slot) => {
                    slot.recv_window = slot.recv_window.saturating_add(credit);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn is_remote_stream_id(&self, id: u32) -> bool {
        let odd = id % 2 == 1;
        match self.direction {
            Direction::Outbound => !odd && id != 0,
            Direction::Inbound => odd,
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        incoming: &mpsc::Sender<(SendStream, RecvStream)>,
    ) {
        let mut table = match self.table.lock() {
            Ok(table) => table,
            Err(_) => return,
        };
        match frame {
            Frame::Open { stream } => {
                let acceptable = self.is_remote_stream_id(stream)
                    && !table.slots.contains_key(&stream)
                    && table.slots.len() < MAX_STREAMS_PER_CONNECTION;
                if !acceptable {
                    drop(table);
                    self.try_send(Frame::Reset { stream });
                    return;
                }
                let pair = register_stream(self, &mut table, stream);
                drop(table);
                if let Err(mpsc::error::TrySendError::Full(pair)) = incoming.try_send(pair) {
                    debug!(conn = self.id, stream, "inbound stream backlog full, resetting");
                    drop(pair);
                    self.try_send(Frame::Reset { stream });
                }
            }
            Frame::Data { stream, payload } => {
                let Some(slot) = table.slots.get_mut(&stream) else {
                    return;
                };
                let len = payload.len() as u32;
                if len > slot.recv_window {
                    debug!(conn = self.id, stream, len, window = slot.recv_window, "flow-control violation");
                    let _ = slot.events.send(StreamEvent::Reset);
                    slot.send_credit.close();
                    table.slots.remove(&stream);
                    drop(table);
                    self.try_send(Frame::Reset { stream });
                    return;
                }
                slot.recv_window -= len;
                if !slot.recv_done {
                    let _ = slot.events.send(StreamEvent::Data(payload));
                }
            }
            Frame::WindowUpdate { stream, credit } => {
                if let Some(slot) = table.slots.get(&stream) {
                    slot.send_credit.add_permits(credit as usize);
                }
            }
            Frame::Fin { stream } => {
                if let Some(slot) = table.slots.get(&stream) {
                    let _ = slot.events.send(StreamEvent::Fin);
                }
            }
            Frame::Reset { stream } => {
                if let Some(slot) = table.slots.remove(&stream) {
                    let _ = slot.events.send(StreamEvent::Reset);
                    slot.send_credit.close();
                }
            }
            Frame::GoAway => {}
        }
    }
}

async fn read_sealed<R: AsyncRead + Unpin>(
    reader: &mut R,
    opener: &mut FrameOpener,
) -> Result<Frame, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_SEALED_FRAME {
        return Err(FrameError::Oversized(len));
    }
    let mut sealed = vec![0u8; len];
    reader.read_exact(&mut sealed).await?;
    let plaintext = opener.open(&sealed)?;
    Frame::decode(&plaintext)
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut opener: FrameOpener,
    shared: Arc<Shared>,
    incoming: mpsc::Sender<(SendStream, RecvStream)>,
) {
    let mut closed = shared.closed.subscribe();
    let reason = loop {
        let frame = tokio::select! {
            frame = read_sealed(&mut reader, &mut opener) => frame,
            _ = closed.wait_for(|c| *c) => break "closed locally".to_string(),
        };
        match frame {
            Ok(Frame::GoAway) => break "remote sent go-away".to_string(),
            Ok(frame) => shared.dispatch(frame, &incoming),
            Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break "remote closed socket".to_string()
            }
            Err(e) => break format!("read failed: {e}"),
        }
    };
    shared.mark_closed(&reason);
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut sealer: FrameSealer,
    mut outbound: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
) {
    let mut closed = shared.closed.subscribe();
    let reason = loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break "outbound queue dropped".to_string(),
            },
            _ = closed.wait_for(|c| *c) => break "closed locally".to_string(),
        };
        let go_away = frame == Frame::GoAway;
        let sealed = match sealer.seal(&frame.encode()) {
            Ok(sealed) => sealed,
            Err(e) => break format!("seal failed: {e}"),
        };
        let mut buf = Vec::with_capacity(4 + sealed.len());
        buf.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        buf.extend_from_slice(&sealed);
        if let Err(e) = writer.write_all(&buf).await {
            break format!("write failed: {e}");
        }
        if go_away {
            break "sent go-away".to_string();
        }
    };
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    shared.mark_closed(&reason);
}

/// Writing half of a stream.
pub struct SendStream {
    id: u32,
    shared: Arc<Shared>,
    credit: Arc<Semaphore>,
    finished: bool,
}

impl SendStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), StreamError> {
        if self.finished {
            return Err(StreamError::Finished);
        }
        while !buf.is_empty() {
            let n = buf.len().min(MAX_DATA_FRAME);
            let permit = self.credit.acquire_many(n as u32).await.map_err(|_| {
                if self.shared.is_closed() {
                    StreamError::ConnectionClosed
                } else {
                    StreamError::Reset
                }
            })?;
            permit.forget();
            self.shared
                .send(Frame::Data {
                    stream: self.id,
                    payload: buf[..n].to_vec(),
                })
                .await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Half-close: the remote reader sees end of stream after the buffered data.
    pub async fn finish(&mut self) -> Result<(), StreamError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let result = self.shared.send(Frame::Fin { stream: self.id }).await;
        self.shared.release(self.id, true);
        result
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.try_send(Frame::Fin { stream: self.id });
            self.shared.release(self.id, true);
        }
    }
}

/// Reading half of a stream.
pub struct RecvStream {
    id: u32,
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    pending: Vec<u8>,
    offset: usize,
    eof: bool,
    unacked: u32,
}

impl RecvStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Read into `buf`; `Ok(0)` means the remote finished the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.offset < self.pending.len() {
                let n = (self.pending.len() - self.offset).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                self.offset += n;
                self.consumed(n as u32).await;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            match self.events.recv().await {
                Some(StreamEvent::Data(data)) => {
                    self.pending = data;
                    self.offset = 0;
                }
                Some(StreamEvent::Fin) => self.eof = true,
                Some(StreamEvent::Reset) => return Err(StreamError::Reset),
                None => return Err(StreamError::ConnectionClosed),
            }
        }
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(StreamError::UnexpectedEof);
            }
            filled += n;
        }
        Ok(())
    }

    /// Read until the remote finishes, failing if more than `limit` bytes arrive.
    pub async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; MAX_DATA_FRAME];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            if out.len() + n > limit {
                return Err(StreamError::TooLarge { limit });
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    async fn consumed(&mut self, n: u32) {
        self.unacked += n;
        if self.unacked < WINDOW_UPDATE_THRESHOLD {
            return;
        }
        let credit = std::mem::take(&mut self.unacked);
        if self.shared.grant(self.id, credit) {
            let _ = self
                .shared
                .send(Frame::WindowUpdate {
                    stream: self.id,
                    credit,
                })
                .await;
        }
    }
}

impl Drop for RecvStream {
    fn drop(&mut self) {
        if !self.eof {
            // Tell the writer nobody is listening any more.
            self.shared.try_send(Frame::Reset { stream: self.id });
        }
        self.shared.release(self.id, false);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    /// Two connected multiplexers over an in-memory pipe.
    pub(crate) fn connected_pair() -> (Connection, Connection) {
        let (left, right) = tokio::io::duplex(1 << 20);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let shared_secret = [42u8; 32];
        let transcript = [7u8; 32];
        let a_peer = PeerId::from_bytes([0xA0; 32]);
        let b_peer = PeerId::from_bytes([0xB0; 32]);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let a = Connection::spawn(
            lr,
            lw,
            SessionKeys::derive(&shared_secret, &transcript, true),
            b_peer,
            addr,
            Direction::Outbound,
            1,
        );
        let b = Connection::spawn(
            rr,
            rw,
            SessionKeys::derive(&shared_secret, &transcript, false),
            a_peer,
            addr,
            Direction::Inbound,
            2,
        );
        (a, b)
    }

    #[test]
    fn frame_encoding_roundtrip() {
        let frames = [
            Frame::Open { stream: 1 },
            Frame::Data {
                stream: 3,
                payload: b"abc".to_vec(),
            },
            Frame::WindowUpdate {
                stream: 5,
                credit: 1234,
            },
            Frame::Fin { stream: 7 },
            Frame::Reset { stream: 9 },
            Frame::GoAway,
        ];
        for frame in frames {
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
        assert!(Frame::decode(&[0, 0, 0]).is_err());
        assert!(Frame::decode(&[0, 0, 0, 1, 99]).is_err());
    }

    #[tokio::test]
    async fn stream_delivers_bytes_in_order() {
        let (a, b) = connected_pair();
        assert_eq!(a.stream_count(), 0);
        let (mut send, _recv) = a.open_bi().await.unwrap();
        assert_eq!(a.stream_count(), 1);
        send.write_all(b"ping").await.unwrap();
        send.finish().await.unwrap();

        let (_bsend, mut brecv) = b.accept_bi().await.unwrap();
        let data = brecv.read_to_end(1024).await.unwrap();
        assert_eq!(data, b"ping");
    }

    #[tokio::test]
    async fn fin_survives_full_outbound_queue() {
        let (a, b) = connected_pair();
        let (mut send, _recv) = a.open_bi().await.unwrap();
        send.write_all(b"tail").await.unwrap();
        while a
            .shared
            .outbound
            .try_send(Frame::WindowUpdate { stream: 99, credit: 1 })
            .is_ok()
        {}
        drop(send);

        let (_bsend, mut brecv) = b.accept_bi().await.unwrap();
        let data = tokio::time::timeout(Duration::from_secs(5), brecv.read_to_end(1024))
            .await
            .expect("FIN never arrived")
            .unwrap();
        assert_eq!(data, b"tail");
    }

    #[tokio::test]
    async fn request_response_on_one_stream() {
        let (a, b) = connected_pair();
        let server = tokio::spawn(async move {
            let (mut send, mut recv) = b.accept_bi().await.unwrap();
            let mut buf = [0u8; 5];
            recv.read_exact(&mut buf).await.unwrap();
            send.write_all(&buf.iter().rev().copied().collect::<Vec<_>>())
                .await
                .unwrap();
            send.finish().await.unwrap();
            b
        });

        let (mut send, mut recv) = a.open_bi().await.unwrap();
        send.write_all(b"hello").await.unwrap();
        let reply = recv.read_to_end(64).await.unwrap();
        assert_eq!(reply, b"olleh");
        let _b = server.await.unwrap();
    }

    #[tokio::test]
    async fn large_transfer_crosses_window_updates() {
        let (a, b) = connected_pair();
        let payload: Vec<u8> = (0..(INITIAL_WINDOW as usize * 3)).map(|i| i as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            let (mut send, _recv) = a.open_bi().await.unwrap();
            send.write_all(&payload).await.unwrap();
            send.finish().await.unwrap();
            a
        });

        let (_send, mut recv) = b.accept_bi().await.unwrap();
        let received = recv.read_to_end(expected.len()).await.unwrap();
        assert_eq!(received, expected);
        let _a = writer.await.unwrap();
    }

    #[tokio::test]
    async fn stalled_stream_does_not_block_others() {
        let (a, b) = connected_pair();

        let (mut stalled, _stalled_recv) = a.open_bi().await.unwrap();
        let (_b_stalled_send, _b_stalled_recv) = b.accept_bi().await.unwrap();

        // Fill the stalled stream's window; nobody reads it on the other side.
        stalled
            .write_all(&vec![0u8; INITIAL_WINDOW as usize])
            .await
            .unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(200), stalled.write_all(&[1u8]))
            .await;
        assert!(blocked.is_err(), "write past the window must wait for credit");

        let (mut send, _recv) = a.open_bi().await.unwrap();
        send.write_all(b"independent").await.unwrap();
        send.finish().await.unwrap();
        let (_s, mut recv) = b.accept_bi().await.unwrap();
        let data = tokio::time::timeout(Duration::from_secs(2), recv.read_to_end(64))
            .await
            .expect("second stream must not be blocked")
            .unwrap();
        assert_eq!(data, b"independent");
    }

    #[tokio::test]
    async fn streams_fail_after_connection_close() {
        let (a, b) = connected_pair();
        let (mut send, mut recv) = a.open_bi().await.unwrap();
        let (_bs, _br) = b.accept_bi().await.unwrap();

        a.close();
        assert!(a.is_closed());
        assert_eq!(send.write_all(b"x").await, Err(StreamError::ConnectionClosed));
        let mut buf = [0u8; 4];
        assert_eq!(recv.read(&mut buf).await, Err(StreamError::ConnectionClosed));
        assert!(matches!(a.open_bi().await, Err(StreamError::ConnectionClosed)));

        tokio::time::timeout(Duration::from_secs(2), b.closed())
            .await
            .expect("remote observes go-away");
        assert!(matches!(b.accept_bi().await, Err(StreamError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn read_exact_reports_early_eof() {
        let (a, b) = connected_pair();
        let (mut send, _recv) = a.open_bi().await.unwrap();
        send.write_all(b"ab").await.unwrap();
        send.finish().await.unwrap();

        let (_s, mut recv) = b.accept_bi().await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(recv.read_exact(&mut buf).await, Err(StreamError::UnexpectedEof));
    }

    #[tokio::test]
    async fn read_to_end_enforces_limit() {
        let (a, b) = connected_pair();
        let (mut send, _recv) = a.open_bi().await.unwrap();
        send.write_all(&[0u8; 100]).await.unwrap();
        send.finish().await.unwrap();

        let (_s, mut recv) = b.accept_bi().await.unwrap();
        assert_eq!(
            recv.read_to_end(10).await,
            Err(StreamError::TooLarge { limit: 10 })
        );
    }
}
