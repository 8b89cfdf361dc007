use std::os::unix::io::RawFd;
use std::{cmp, io};

/// Reserved headroom at the front of a [`Buffer`], big enough for a later
/// length-prefix insertion. Grounded on muduo's `Buffer::kCheapPrepend`.
const CHEAP_PREPEND: usize = 8;
/// Grounded on muduo's `Buffer::kInitialSize`.
const INITIAL_SIZE: usize = 1024;
/// Size of the stack scratch buffer `read_fd` scatters overflow into.
/// Grounded on `Buffer::readFd`'s `char extrabuf[65536]`.
const EXTRA_BUF_SIZE: usize = 65536;

/// A growable byte buffer with prepend headroom, the input/output buffer of
/// every [`TcpConnection`](crate::TcpConnection).
///
/// Three indices into a single contiguous allocation, in order:
/// `0 <= prependable <= reader_index <= writer_index <= capacity`.
/// `[0, reader_index)` is prependable space, `[reader_index, writer_index)`
/// is the readable region, and `[writer_index, capacity)` is writable space.
///
/// Grounded on muduo's `Buffer` (`Buffer.h`/`.cc`).
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region, `[reader_index, writer_index)`.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consume `len` bytes from the front of the readable region.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds `readable_bytes()`.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    /// Convenience wrapper over [`retrieve_all_as_vec`](Self::retrieve_all_as_vec)
    /// for text protocols; replaces invalid UTF-8 rather than failing, since
    /// the buffer is not guaranteed to hold valid text.
    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_vec()).into_owned()
    }

    /// Write into the headroom reserved at the front of the buffer. Intended
    /// for protocol layers above this core (e.g. a length prefix) that need
    /// to prepend without shifting the already-readable bytes.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` exceeds `prependable_bytes()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Grow the backing store, or compact it by sliding the readable region
    /// back to the headroom origin if the total free space already suffices.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    /// Scatter-read from `fd` into the writable region, using a 64 KiB stack
    /// scratch buffer as a second iovec so a single large read doesn't
    /// require pre-growing the buffer.
    ///
    /// Grounded on muduo's `Buffer::readFd`, translated to `readv(2)` via
    /// `libc` rather than glibc's `<sys/uio.h>` wrapper directly.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra_buf.len(),
            },
        ];
        let iovcnt = if writable < extra_buf.len() { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            let spilled = n - writable;
            self.append(&extra_buf[..spilled]);
        }
        Ok(n)
    }

    /// Write the readable region out to `fd`. Returns the number of bytes
    /// written; partial writes are the caller's responsibility to retry.
    /// Grounded on muduo's `Buffer::writeFd`.
    pub fn write_fd(&self, fd: RawFd) -> io::Result<usize> {
        let n = syscall!(write(
            fd,
            self.peek().as_ptr() as *const libc::c_void,
            cmp::min(self.readable_bytes(), isize::MAX as usize),
        ))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.retrieve_as_vec(5), b"hello");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_all_resets_to_headroom_origin() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        let _ = buf.retrieve_all_as_string();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn partial_retrieve_keeps_remainder() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = Buffer::new();
        let payload = vec![7u8; INITIAL_SIZE * 4];
        buf.append(&payload);
        assert_eq!(buf.readable_bytes(), payload.len());
        assert_eq!(buf.retrieve_all_as_vec(), payload);
    }

    #[test]
    fn make_space_compacts_instead_of_growing_when_free_space_suffices() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; 100]);
        buf.retrieve(90);
        let cap_before = buf.buf.len();
        buf.append(&vec![2u8; 50]);
        assert_eq!(buf.buf.len(), cap_before, "should compact, not grow");
        assert_eq!(buf.readable_bytes(), 60);
    }

    #[test]
    fn prepend_writes_into_headroom() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&4u32.to_be_bytes());
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[..4], &4u32.to_be_bytes());
    }

    #[test]
    fn read_fd_absorbs_more_than_initial_capacity_in_one_call() {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload = vec![9u8; INITIAL_SIZE * 3];
        tx.write_all(&payload).unwrap();
        drop(tx);

        let mut buf = Buffer::new();
        let mut total = 0;
        while total < payload.len() {
            let n = buf.read_fd(rx.as_raw_fd()).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, payload.len());
        assert_eq!(buf.retrieve_all_as_vec(), payload);
    }
}
