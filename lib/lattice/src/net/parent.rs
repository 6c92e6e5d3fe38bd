//! Inbound session: decodes request frames into query contexts and carries
//! responses back. The write side is split off behind an `Arc` so a context
//! can answer from whichever thread ends up processing it; responses are
//! serialized by a per-connection lock to keep frames from interleaving.

use crate::net::buffer::Buffer;
use crate::net::codec::{self, RequestHeader, ResponseHeader};
use crate::net::wire::{WireError, WireResult};
use crate::net::ReadState;
use mio::net::TcpStream;
use mio::{Poll, PollOpt, Ready, Token};
use parking_lot::Mutex;
use pulse::logging::{self, Logger};
use pulse::time;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Arc;

const READ_BUF_SIZE: usize = 64 * 1024;
const WRITE_BUF_SIZE: usize = 64 * 1024;

/// Duplicates the socket so reads and writes can proceed through separate
/// handles. The duplicate shares the open file description, including its
/// non-blocking status.
fn dup_write_handle(stream: &TcpStream) -> io::Result<std::net::TcpStream> {
    let fd = unsafe { libc::dup(stream.as_raw_fd()) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { std::net::TcpStream::from_raw_fd(fd) })
}

struct SendInner {
    wbuf: Buffer,
    stream: std::net::TcpStream,
}

/// Shareable write side of a parent connection. Multiple reactors may emit
/// responses on it under thread load balancing; the lock serializes whole
/// frames. In single-producer mode the lock is never contended.
pub struct SendHalf {
    inner: Mutex<SendInner>,
    log: Logger,
}

impl SendHalf {
    fn new(stream: std::net::TcpStream, log: Logger) -> SendHalf {
        SendHalf {
            inner: Mutex::new(SendInner {
                wbuf: Buffer::with_capacity(WRITE_BUF_SIZE),
                stream,
            }),
            log,
        }
    }

    /// Enqueues one response frame and flushes opportunistically. Leftover
    /// bytes drain on the owning reactor's writable events.
    pub fn send_response(&self, header: &ResponseHeader, payload: &[u8]) {
        let mut inner = self.inner.lock();
        codec::encode_response(&mut inner.wbuf, header, payload);

        let inner = &mut *inner;
        match inner.wbuf.egress(&inner.stream) {
            Ok(_) | Err(WireError::Wait) => (),
            Err(err) => {
                logging::warn!(self.log, "response write failed";
                               "request_id" => header.request_id,
                               "error" => %err);
            }
        }
    }

    /// Pushes any buffered egress to the socket.
    pub fn flush(&self) -> WireResult<usize> {
        let inner = &mut *self.inner.lock();
        inner.wbuf.egress(&inner.stream)
    }

    pub fn has_egress(&self) -> bool {
        !self.inner.lock().wbuf.is_empty()
    }
}

/// Reactor-owned inbound connection. Decoding happens here; the send half is
/// handed out to query contexts.
pub struct ParentConnection {
    stream: TcpStream,
    token: Token,
    rbuf: Buffer,
    send: Arc<SendHalf>,
    state: ReadState,
    log: Logger,
}

impl ParentConnection {
    /// Wraps an accepted stream. Applies `TCP_NODELAY` and splits off the
    /// write handle.
    pub fn accept(stream: TcpStream, token: Token, log: Logger) -> io::Result<ParentConnection> {
        stream.set_nodelay(true)?;
        let write_handle = dup_write_handle(&stream)?;
        let send = Arc::new(SendHalf::new(write_handle, log.clone()));

        Ok(ParentConnection {
            stream,
            token,
            rbuf: Buffer::with_capacity(READ_BUF_SIZE),
            send,
            state: ReadState::Waiting,
            log,
        })
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn sender(&self) -> Arc<SendHalf> {
        Arc::clone(&self.send)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ReadState::Closed
    }

    pub fn register(&self, poll: &Poll) -> io::Result<()> {
        poll.register(
            &self.stream,
            self.token,
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        )
    }

    pub fn deregister(&self, poll: &Poll) -> io::Result<()> {
        poll.deregister(&self.stream)
    }

    /// Pulls whatever the socket has into the receive buffer. `Closed` marks
    /// the terminal state; further decoding still drains frames that arrived
    /// before the EOF.
    pub fn fill(&mut self) -> WireResult<usize> {
        debug_assert!(self.state != ReadState::Closed, "read on closed connection");

        match self.rbuf.ingress(&mut self.stream) {
            Ok(count) => Ok(count),
            Err(WireError::Closed) => {
                logging::debug!(self.log, "peer closed connection"; "token" => self.token.0);
                self.state = ReadState::Closed;
                Err(WireError::Closed)
            }
            Err(err) => {
                self.state = ReadState::Closed;
                Err(err)
            }
        }
    }

    /// Pops one decoded request, if a whole frame is buffered.
    pub fn take_query(&mut self) -> Option<(RequestHeader, Vec<u8>)> {
        codec::decode_request(&mut self.rbuf)
    }

    /// Flushes buffered responses; called on writable events and on the
    /// reactor's periodic sweep.
    pub fn flush(&self) -> WireResult<usize> {
        self.send.flush()
    }
}

/// One in-flight request at a receiving node. Owns the decoded payload and
/// must produce exactly one response before it is dropped.
pub struct QueryContext {
    pub kind: u32,
    pub request_id: u64,
    pub start_time: u64,
    pub received_time: u64,
    payload: Vec<u8>,
    sender: Arc<SendHalf>,
    sent: Option<ResponseHeader>,
    log: Logger,
}

impl QueryContext {
    pub(crate) fn new(
        header: RequestHeader,
        payload: Vec<u8>,
        sender: Arc<SendHalf>,
        log: Logger,
    ) -> QueryContext {
        QueryContext {
            kind: header.kind,
            request_id: header.request_id,
            start_time: header.start_time,
            received_time: time::monotonic_ns(),
            payload,
            sender,
            sent: None,
            log,
        }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Received packet length, header included.
    #[inline]
    pub fn packet_len(&self) -> usize {
        codec::REQUEST_HEADER_LEN + self.payload.len()
    }

    /// Sends the response, echoing the request identity and stamping the
    /// receive-to-send processing time.
    pub fn send_response(&mut self, payload: &[u8]) {
        if self.sent.is_some() {
            logging::warn!(self.log, "duplicate response suppressed";
                           "kind" => self.kind, "request_id" => self.request_id);
            debug_assert!(false, "second response for request {}", self.request_id);
            return;
        }

        let header = ResponseHeader {
            kind: self.kind,
            request_id: self.request_id,
            start_time: self.start_time,
            processing_time: time::monotonic_ns().saturating_sub(self.received_time),
            payload_len: payload.len() as u32,
        };
        self.sender.send_response(&header, payload);
        self.sent = Some(header);
    }

    /// Header of the response that was sent, if any. The processing thread
    /// uses this to account the response in its own stats.
    #[inline]
    pub fn sent_response(&self) -> Option<&ResponseHeader> {
        self.sent.as_ref()
    }
}

impl Drop for QueryContext {
    fn drop(&mut self) {
        if self.sent.is_none() {
            logging::warn!(self.log, "query context dropped without a response";
                           "kind" => self.kind,
                           "request_id" => self.request_id,
                           "payload_len" => self.payload.len());
            debug_assert!(
                false,
                "query {} of kind {} dropped without a response",
                self.request_id, self.kind
            );
        }
    }
}
