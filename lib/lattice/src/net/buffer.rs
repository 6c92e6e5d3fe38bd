use crate::net::wire::{WireError, WireResult};
use slice_deque::SliceDeque;
use std::io;

// How much headroom to guarantee before each socket read.
const READ_CHUNK: usize = 16 * 1024;

/// Contiguous FIFO byte queue backing one direction of a connection. Data is
/// appended at the tail and consumed from the head; both views are plain
/// slices, which is what the frame codec wants.
pub struct Buffer {
    data: SliceDeque<u8>,
}

impl Buffer {
    #[inline]
    pub fn with_capacity(capacity: usize) -> Buffer {
        let mut data = SliceDeque::new();
        data.reserve(capacity);
        Buffer { data }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    /// Slice over the buffered bytes, oldest first.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Drops `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        unsafe { self.data.move_head(len as isize) }
    }

    /// Appends raw bytes at the tail, growing if needed.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.reserve(bytes.len());
        unsafe {
            self.data.tail_head_slice()[..bytes.len()].copy_from_slice(bytes);
            self.data.move_tail(bytes.len() as isize);
        }
    }

    /// Reads from `reader` until it would block. Returns the number of bytes
    /// pulled in; an immediate end of stream surfaces as `Closed`.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> WireResult<usize> {
        let mut received = 0;

        loop {
            if self.free_capacity() < READ_CHUNK {
                self.data.reserve(READ_CHUNK);
            }

            let count = unsafe {
                match reader.read(self.data.tail_head_slice()) {
                    Ok(count) => count,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(received)
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(WireError::Io(err)),
                }
            };

            if count == 0 {
                return Err(WireError::Closed);
            }

            unsafe { self.data.move_tail(count as isize) };
            received += count;
        }
    }

    /// Writes buffered bytes to `writer` until drained or it would block.
    /// Returns the number of bytes flushed.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> WireResult<usize> {
        let mut sent = 0;

        while !self.data.is_empty() {
            let count = match writer.write(&self.data) {
                Ok(count) => count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(sent),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(WireError::Io(err)),
            };

            if count == 0 {
                return Err(WireError::Io(io::ErrorKind::WriteZero.into()));
            }

            self.consume(count);
            sent += count;
        }

        Ok(sent)
    }
}
