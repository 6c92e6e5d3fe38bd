//! Outbound session: issues requests downstream and demultiplexes replies.
//! Replies on one connection are FIFO with respect to issued requests; the
//! connection only counts what is in flight, depth policy lives with the
//! caller.

use crate::net::buffer::Buffer;
use crate::net::codec::{self, RequestHeader, ResponseHeader};
use crate::net::wire::{WireError, WireResult};
use crate::net::ReadState;
use crate::stats::ChildStats;
use mio::net::TcpStream;
use mio::{Poll, PollOpt, Ready, Token};
use pulse::logging::{self, Logger};
use pulse::time;
use std::io;
use std::net::SocketAddr;

const READ_BUF_SIZE: usize = 64 * 1024;
const WRITE_BUF_SIZE: usize = 64 * 1024;

pub struct ChildConnection {
    stream: TcpStream,
    token: Token,
    rbuf: Buffer,
    wbuf: Buffer,
    outstanding: u32,
    state: ReadState,
    log: Logger,
}

impl ChildConnection {
    /// Connects to a downstream node. The connect itself is blocking so
    /// setup failures surface immediately (the simulator treats them as
    /// fatal); the socket then switches to non-blocking with `TCP_NODELAY`.
    pub fn connect(addr: &SocketAddr, token: Token, log: Logger) -> io::Result<ChildConnection> {
        let stream = std::net::TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_stream(stream)?;

        logging::debug!(log, "child connection established";
                        "peer" => %addr, "token" => token.0);

        Ok(ChildConnection {
            stream,
            token,
            rbuf: Buffer::with_capacity(READ_BUF_SIZE),
            wbuf: Buffer::with_capacity(WRITE_BUF_SIZE),
            outstanding: 0,
            state: ReadState::Waiting,
            log,
        })
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Requests issued but not yet answered.
    #[inline]
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ReadState::Closed
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.wbuf.is_empty()
    }

    pub fn register(&self, poll: &Poll) -> io::Result<()> {
        poll.register(
            &self.stream,
            self.token,
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        )
    }

    /// Enqueues one request frame, stamping the issue time, and flushes
    /// opportunistically.
    pub fn issue_request(
        &mut self,
        kind: u32,
        request_id: u64,
        payload: &[u8],
        stats: &mut ChildStats,
    ) {
        let header = RequestHeader {
            kind,
            request_id,
            start_time: time::monotonic_ns(),
            payload_len: payload.len() as u32,
        };
        codec::encode_request(&mut self.wbuf, &header, payload);
        stats.log_request(&header);
        self.outstanding += 1;

        match self.flush() {
            Ok(_) | Err(WireError::Wait) => (),
            Err(err) => {
                logging::warn!(self.log, "request write failed";
                               "request_id" => request_id, "error" => %err);
                self.state = ReadState::Closed;
            }
        }
    }

    pub fn fill(&mut self) -> WireResult<usize> {
        debug_assert!(self.state != ReadState::Closed, "read on closed connection");

        match self.rbuf.ingress(&mut self.stream) {
            Ok(count) => Ok(count),
            Err(WireError::Closed) => {
                logging::debug!(self.log, "downstream closed connection"; "token" => self.token.0);
                self.state = ReadState::Closed;
                Err(WireError::Closed)
            }
            Err(err) => {
                self.state = ReadState::Closed;
                Err(err)
            }
        }
    }

    /// Pops one decoded reply and drains the matching in-flight slot.
    pub fn take_reply(&mut self) -> Option<(ResponseHeader, Vec<u8>)> {
        let reply = codec::decode_response(&mut self.rbuf);
        if reply.is_some() {
            debug_assert!(self.outstanding > 0, "reply with nothing outstanding");
            self.outstanding = self.outstanding.saturating_sub(1);
        }
        reply
    }

    pub fn flush(&mut self) -> WireResult<usize> {
        self.wbuf.egress(&mut self.stream)
    }
}

/// Read-only view of one reply, handed to the requester's reply path.
#[derive(Debug)]
pub struct ResponseContext<'a> {
    pub kind: u32,
    pub request_id: u64,
    pub payload: &'a [u8],
    pub timed_out: bool,
    /// Issue timestamp echoed back by the responder.
    pub request_timestamp: u64,
    /// Local receive timestamp.
    pub response_timestamp: u64,
}

impl<'a> ResponseContext<'a> {
    #[inline]
    pub fn latency_ns(&self) -> u64 {
        self.response_timestamp.saturating_sub(self.request_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::{decode_request, encode_response};
    use pulse::logging::discard;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn connected_pair() -> (ChildConnection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = ChildConnection::connect(&addr, Token(20), discard()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        (conn, peer)
    }

    fn read_request(peer: &mut std::net::TcpStream) -> (RequestHeader, Vec<u8>) {
        let mut buf = Buffer::with_capacity(1024);
        let mut chunk = [0u8; 256];
        loop {
            if let Some(frame) = decode_request(&mut buf) {
                return frame;
            }
            let count = peer.read(&mut chunk).unwrap();
            assert!(count > 0, "peer stream ended early");
            buf.extend(&chunk[..count]);
        }
    }

    #[test]
    fn test_issue_request_and_receive_reply() {
        let (mut conn, mut peer) = connected_pair();
        let mut stats = ChildStats::new(&[3]);

        conn.issue_request(3, 17, b"work", &mut stats);
        assert_eq!(conn.outstanding(), 1);

        let (header, payload) = read_request(&mut peer);
        assert_eq!(header.kind, 3);
        assert_eq!(header.request_id, 17);
        assert_eq!(payload, b"work");

        let reply = ResponseHeader {
            kind: header.kind,
            request_id: header.request_id,
            start_time: header.start_time,
            processing_time: 1_000,
            payload_len: 6,
        };
        let mut out = Buffer::with_capacity(64);
        encode_response(&mut out, &reply, b"result");
        peer.write_all(out.peek()).unwrap();

        let (decoded, body) = loop {
            match conn.fill() {
                Ok(_) | Err(WireError::Wait) => (),
                Err(err) => panic!("fill failed: {}", err),
            }
            if let Some(frame) = conn.take_reply() {
                break frame;
            }
            thread::sleep(Duration::from_millis(2));
        };

        assert_eq!(decoded.request_id, 17);
        assert_eq!(decoded.start_time, header.start_time);
        assert_eq!(body, b"result");
        assert_eq!(conn.outstanding(), 0);
    }

    #[test]
    fn test_replies_are_fifo_per_connection() {
        let (mut conn, mut peer) = connected_pair();
        let mut stats = ChildStats::new(&[1]);

        for id in 0..4u64 {
            conn.issue_request(1, id, &[id as u8], &mut stats);
        }
        assert_eq!(conn.outstanding(), 4);

        // Echo all four back in arrival order.
        for _ in 0..4 {
            let (header, payload) = read_request(&mut peer);
            let reply = ResponseHeader {
                kind: header.kind,
                request_id: header.request_id,
                start_time: header.start_time,
                processing_time: 0,
                payload_len: payload.len() as u32,
            };
            let mut out = Buffer::with_capacity(64);
            encode_response(&mut out, &reply, &payload);
            peer.write_all(out.peek()).unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 4 {
            match conn.fill() {
                Ok(_) | Err(WireError::Wait) => (),
                Err(err) => panic!("fill failed: {}", err),
            }
            while let Some((header, _)) = conn.take_reply() {
                seen.push(header.request_id);
            }
            thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(conn.outstanding(), 0);
    }

    #[test]
    fn test_connect_failure_is_an_error() {
        // A freshly bound then dropped listener leaves a port nothing
        // listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        assert!(ChildConnection::connect(&addr, Token(21), discard()).is_err());
    }

    #[test]
    fn test_eof_marks_closed() {
        let (mut conn, peer) = connected_pair();
        drop(peer);

        let mut closed = false;
        for _ in 0..500 {
            match conn.fill() {
                Err(WireError::Closed) => {
                    closed = true;
                    break;
                }
                Ok(_) | Err(WireError::Wait) => thread::sleep(Duration::from_millis(2)),
                Err(err) => panic!("unexpected error {}", err),
            }
        }
        assert!(closed);
        assert!(conn.is_closed());
    }
}
