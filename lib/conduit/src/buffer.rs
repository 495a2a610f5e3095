use crate::error::{ErrorKind, NetError, NetResult};
use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Growth happens in page-friendly steps.
const GROW_CHUNK: usize = 65536;

/// Contiguous FIFO byte area with grab/commit semantics. Producers grab a
/// writable span and commit what they filled; consumers grab the readable
/// span and commit what they parsed. Capacity grows on demand up to a hard
/// cap; exceeding the cap is a write failure, not an allocation.
pub struct Buffer {
    data: ByteDeque,
    cap: usize,
}

impl Buffer {
    pub fn new(initial: usize, cap: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(initial);
        Buffer { data, cap }
    }

    /// The number of readable bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Free space already reserved, before any growth.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Borrowed view of the currently filled bytes.
    #[inline]
    pub fn grab_read(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Marks `count` readable bytes as consumed.
    #[inline]
    pub fn commit_read(&mut self, count: usize) {
        debug_assert!(count <= self.data.len());
        unsafe { self.data.move_head(count as isize) }
    }

    /// Borrowed writable span of at least `count` bytes, growing capacity as
    /// needed. Fails with `WriteFailed` when the span would push the buffer
    /// past its cap.
    pub fn grab_write(&mut self, count: usize) -> NetResult<&mut [u8]> {
        if self.data.len() + count > self.cap {
            return Err(NetError::Fatal(ErrorKind::WriteFailed));
        }

        if self.free_capacity() < count {
            let needed = count - self.free_capacity();
            let extra = ((needed + GROW_CHUNK - 1) / GROW_CHUNK) * GROW_CHUNK;
            self.data.reserve(extra);
        }

        Ok(unsafe { &mut self.data.tail_head_slice()[..count] })
    }

    /// Publishes `count` bytes previously filled through `grab_write`.
    #[inline]
    pub fn commit_write(&mut self, count: usize) {
        debug_assert!(count <= self.free_capacity());
        unsafe { self.data.move_tail(count as isize) }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        unsafe { self.data.move_head(len as isize) };
    }

    /// Pulls bytes from the reader until it would block or `high_water`
    /// readable bytes are buffered. Returns bytes read this call; a clean
    /// remote close surfaces as `UnexpectedEof`.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R, high_water: usize) -> io::Result<usize> {
        let mut total = 0;

        while self.data.len() < high_water {
            let want = (high_water - self.data.len()).min(GROW_CHUNK);
            let span = match self.grab_write(want) {
                Ok(span) => span,
                Err(_) => break,
            };

            match reader.read(span) {
                Ok(0) => {
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(n) => {
                    self.commit_write(n);
                    total += n;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    /// Drains readable bytes into the writer until it would block or the
    /// buffer is empty. Returns bytes written this call.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while !self.data.is_empty() {
            match writer.write(self.data.as_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.commit_read(n);
                    total += n;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockPipe {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockPipe {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockPipe {
            MockPipe {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_grab_commit_roundtrip() {
        let mut buffer = Buffer::new(GROW_CHUNK, GROW_CHUNK * 4);

        let span = buffer.grab_write(5).unwrap();
        span.copy_from_slice(b"hello");
        buffer.commit_write(5);

        assert_eq!(buffer.grab_read(), b"hello");

        buffer.commit_read(2);
        assert_eq!(buffer.grab_read(), b"llo");
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_grab_write_grows_without_moving_committed_bytes() {
        let mut buffer = Buffer::new(GROW_CHUNK, GROW_CHUNK * 8);

        let span = buffer.grab_write(3).unwrap();
        span.copy_from_slice(b"abc");
        buffer.commit_write(3);

        // Demand far beyond the reserved region forces growth.
        let big = buffer.grab_write(GROW_CHUNK * 2).unwrap();
        assert_eq!(big.len(), GROW_CHUNK * 2);

        assert_eq!(buffer.grab_read(), b"abc");
    }

    #[test]
    fn test_grab_write_respects_cap() {
        let mut buffer = Buffer::new(GROW_CHUNK, GROW_CHUNK);

        buffer.grab_write(GROW_CHUNK).unwrap();

        let result = buffer.grab_write(GROW_CHUNK + 1);
        assert_eq!(result.unwrap_err(), NetError::Fatal(ErrorKind::WriteFailed));
    }

    #[test]
    fn test_ingress_egress_roundtrip() {
        let mock_data: Vec<_> = (0..GROW_CHUNK / 2).map(|item| item as u8).collect();
        let mut pipe = MockPipe::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(GROW_CHUNK, GROW_CHUNK * 4);

        let read = buffer.ingress(&mut pipe, GROW_CHUNK).unwrap();
        assert_eq!(read, mock_data.len());
        assert_eq!(buffer.grab_read(), &mock_data[..]);

        pipe.clear();
        let written = buffer.egress(&mut pipe).unwrap();
        assert_eq!(written, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(pipe.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_stops_at_high_water() {
        let mock_data = vec![7u8; 4096];
        let mut pipe = MockPipe::new(mock_data, 512, 4096);

        let mut buffer = Buffer::new(GROW_CHUNK, GROW_CHUNK);

        let read = buffer.ingress(&mut pipe, 1024).unwrap();
        assert_eq!(read, 1024);
        assert_eq!(buffer.len(), 1024);
    }

    #[test]
    fn test_ingress_eof() {
        let empty: &[u8] = &[];
        let mut buffer = Buffer::new(GROW_CHUNK, GROW_CHUNK);

        let err = buffer.ingress(empty, 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        struct ZeroSink;
        impl io::Write for ZeroSink {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = Buffer::new(GROW_CHUNK, GROW_CHUNK);
        let span = buffer.grab_write(1).unwrap();
        span[0] = 1;
        buffer.commit_write(1);

        let err = buffer.egress(ZeroSink).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_clear() {
        let mut buffer = Buffer::new(GROW_CHUNK, GROW_CHUNK);
        let span = buffer.grab_write(4).unwrap();
        span.copy_from_slice(b"data");
        buffer.commit_write(4);

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
