//! The binary channel: framing primitives over a duplex byte stream.

use crate::error::{WireError, WireResult};
use crate::types::{ClusterPosition, RecordVersion, Rid};
use parking_lot::{Condvar, Mutex};
use std::io::{Read, Write};
use std::thread::{self, ThreadId};

/// Largest length prefix the channel will honour for strings and blobs.
///
/// Guards against allocation from untrusted length prefixes.
const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// Serialises writers on a channel.
///
/// Exactly one response may be composed on a channel at a time; the
/// dispatcher acquires the lock before the status byte and releases it
/// after the flush. Acquire and release are explicit because a response
/// spans several writer calls and error paths must be able to test
/// whether the current thread still holds the lock.
#[derive(Debug, Default)]
pub struct ChannelLock {
    holder: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl ChannelLock {
    /// Creates an unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock is free, then takes it for the current thread.
    pub fn acquire(&self) {
        let mut holder = self.holder.lock();
        while holder.is_some() {
            self.released.wait(&mut holder);
        }
        *holder = Some(thread::current().id());
    }

    /// Releases the lock. A release by a non-holder is ignored.
    pub fn release(&self) {
        let mut holder = self.holder.lock();
        if *holder == Some(thread::current().id()) {
            *holder = None;
            self.released.notify_one();
        }
    }

    /// True when the calling thread holds the lock.
    #[must_use]
    pub fn held_by_current_thread(&self) -> bool {
        *self.holder.lock() == Some(thread::current().id())
    }
}

/// Fixed-endian reader/writer over a duplex byte stream.
///
/// All multi-byte integers are big-endian. Strings and byte arrays are
/// i32-length-prefixed; a negative length encodes `None`. Readers are
/// single-threaded per connection; writers coordinate through the
/// channel's [`ChannelLock`].
pub struct BinaryChannel<S> {
    stream: S,
}

impl<S: Read + Write> BinaryChannel<S> {
    /// Wraps a stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Consumes the channel, returning the stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Returns the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    // Readers ---------------------------------------------------------------

    /// Reads one byte.
    pub fn read_byte(&mut self) -> WireResult<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a boolean encoded as one byte.
    pub fn read_bool(&mut self) -> WireResult<bool> {
        Ok(self.read_byte()? == 1)
    }

    /// Reads a big-endian i16.
    pub fn read_short(&mut self) -> WireResult<i16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }

    /// Reads a big-endian i32.
    pub fn read_int(&mut self) -> WireResult<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Reads a big-endian i64.
    pub fn read_long(&mut self) -> WireResult<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Reads a length-prefixed UTF-8 string; negative length is `None`.
    pub fn read_string(&mut self) -> WireResult<Option<String>> {
        match self.read_blob()? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| WireError::InvalidUtf8),
        }
    }

    /// Reads a length-prefixed byte array; negative length is `None`.
    pub fn read_bytes(&mut self) -> WireResult<Option<Vec<u8>>> {
        self.read_blob()
    }

    /// Reads a record identifier.
    pub fn read_rid(&mut self) -> WireResult<Rid> {
        let cluster_id = self.read_short()?;
        let position = self.read_cluster_position()?;
        Ok(Rid::new(cluster_id, position))
    }

    /// Reads a record version.
    pub fn read_version(&mut self) -> WireResult<RecordVersion> {
        Ok(RecordVersion::from_wire(self.read_int()?))
    }

    /// Reads a cluster position.
    pub fn read_cluster_position(&mut self) -> WireResult<ClusterPosition> {
        Ok(ClusterPosition::new(self.read_long()?))
    }

    fn read_blob(&mut self) -> WireResult<Option<Vec<u8>>> {
        let len = self.read_int()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as u64;
        if len > MAX_FRAME_BYTES {
            return Err(WireError::SizeLimitExceeded {
                claimed: len,
                max_allowed: MAX_FRAME_BYTES,
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> WireResult<()> {
        self.stream.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                WireError::UnexpectedEof
            } else {
                WireError::Io(e)
            }
        })
    }

    // Writers ---------------------------------------------------------------

    /// Writes one byte.
    pub fn write_byte(&mut self, value: u8) -> WireResult<()> {
        self.stream.write_all(&[value])?;
        Ok(())
    }

    /// Writes a boolean as one byte.
    pub fn write_bool(&mut self, value: bool) -> WireResult<()> {
        self.write_byte(u8::from(value))
    }

    /// Writes a big-endian i16.
    pub fn write_short(&mut self, value: i16) -> WireResult<()> {
        self.stream.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    /// Writes a big-endian i32.
    pub fn write_int(&mut self, value: i32) -> WireResult<()> {
        self.stream.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    /// Writes a big-endian i64.
    pub fn write_long(&mut self, value: i64) -> WireResult<()> {
        self.stream.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> WireResult<()> {
        self.write_blob(Some(value.as_bytes()))
    }

    /// Writes an optional length-prefixed string; `None` is length `-1`.
    pub fn write_opt_string(&mut self, value: Option<&str>) -> WireResult<()> {
        self.write_blob(value.map(str::as_bytes))
    }

    /// Writes a length-prefixed byte array.
    pub fn write_bytes(&mut self, value: &[u8]) -> WireResult<()> {
        self.write_blob(Some(value))
    }

    /// Writes an optional length-prefixed byte array; `None` is length `-1`.
    pub fn write_opt_bytes(&mut self, value: Option<&[u8]>) -> WireResult<()> {
        self.write_blob(value)
    }

    /// Writes a record identifier.
    pub fn write_rid(&mut self, rid: Rid) -> WireResult<()> {
        self.write_short(rid.cluster_id)?;
        self.write_cluster_position(rid.position)
    }

    /// Writes a record version.
    pub fn write_version(&mut self, version: RecordVersion) -> WireResult<()> {
        self.write_int(version.to_wire())
    }

    /// Writes a cluster position.
    pub fn write_cluster_position(&mut self, position: ClusterPosition) -> WireResult<()> {
        self.write_long(position.as_i64())
    }

    fn write_blob(&mut self, value: Option<&[u8]>) -> WireResult<()> {
        match value {
            None => self.write_int(-1),
            Some(bytes) => {
                if bytes.len() as u64 > MAX_FRAME_BYTES {
                    return Err(WireError::SizeLimitExceeded {
                        claimed: bytes.len() as u64,
                        max_allowed: MAX_FRAME_BYTES,
                    });
                }
                self.write_int(bytes.len() as i32)?;
                self.stream.write_all(bytes)?;
                Ok(())
            }
        }
    }

    /// Flushes buffered output to the peer.
    pub fn flush(&mut self) -> WireResult<()> {
        self.stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    fn channel_over(buf: Vec<u8>) -> BinaryChannel<Cursor<Vec<u8>>> {
        BinaryChannel::new(Cursor::new(buf))
    }

    fn written(ch: BinaryChannel<Cursor<Vec<u8>>>) -> Vec<u8> {
        ch.into_inner().into_inner()
    }

    #[test]
    fn primitive_roundtrip() {
        let mut ch = channel_over(Vec::new());
        ch.write_byte(7).unwrap();
        ch.write_short(-2).unwrap();
        ch.write_int(90_000).unwrap();
        ch.write_long(-5_000_000_000).unwrap();
        ch.write_bool(true).unwrap();

        let mut ch = channel_over(written(ch));
        assert_eq!(ch.read_byte().unwrap(), 7);
        assert_eq!(ch.read_short().unwrap(), -2);
        assert_eq!(ch.read_int().unwrap(), 90_000);
        assert_eq!(ch.read_long().unwrap(), -5_000_000_000);
        assert!(ch.read_bool().unwrap());
    }

    #[test]
    fn string_roundtrip() {
        let mut ch = channel_over(Vec::new());
        ch.write_string("demo").unwrap();
        ch.write_opt_string(None).unwrap();
        ch.write_string("").unwrap();

        let mut ch = channel_over(written(ch));
        assert_eq!(ch.read_string().unwrap().as_deref(), Some("demo"));
        assert_eq!(ch.read_string().unwrap(), None);
        assert_eq!(ch.read_string().unwrap().as_deref(), Some(""));
    }

    #[test]
    fn string_wire_form() {
        let mut ch = channel_over(Vec::new());
        ch.write_string("ab").unwrap();
        assert_eq!(written(ch), vec![0, 0, 0, 2, b'a', b'b']);

        let mut ch = channel_over(Vec::new());
        ch.write_opt_string(None).unwrap();
        assert_eq!(written(ch), vec![0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn bytes_roundtrip() {
        let mut ch = channel_over(Vec::new());
        ch.write_bytes(&[1, 2, 3]).unwrap();
        ch.write_opt_bytes(None).unwrap();

        let mut ch = channel_over(written(ch));
        assert_eq!(ch.read_bytes().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(ch.read_bytes().unwrap(), None);
    }

    #[test]
    fn rid_and_version_roundtrip() {
        let rid = Rid::new(9, ClusterPosition::new(77));
        let mut ch = channel_over(Vec::new());
        ch.write_rid(rid).unwrap();
        ch.write_version(RecordVersion::Tracked(3)).unwrap();
        ch.write_version(RecordVersion::Untracked).unwrap();
        ch.write_version(RecordVersion::Tombstone).unwrap();

        let mut ch = channel_over(written(ch));
        assert_eq!(ch.read_rid().unwrap(), rid);
        assert_eq!(ch.read_version().unwrap(), RecordVersion::Tracked(3));
        assert_eq!(ch.read_version().unwrap(), RecordVersion::Untracked);
        assert_eq!(ch.read_version().unwrap(), RecordVersion::Tombstone);
    }

    #[test]
    fn rid_wire_width() {
        let mut ch = channel_over(Vec::new());
        ch.write_rid(Rid::new(1, ClusterPosition::new(2))).unwrap();
        assert_eq!(written(ch).len(), Rid::SERIALIZED_SIZE);
    }

    #[test]
    fn truncated_frame_is_eof() {
        let mut ch = channel_over(vec![0, 0, 0, 9, b'x']);
        assert!(matches!(
            ch.read_string(),
            Err(WireError::UnexpectedEof)
        ));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let mut ch = channel_over(vec![0x7f, 0xff, 0xff, 0xff]);
        assert!(matches!(
            ch.read_bytes(),
            Err(WireError::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn lock_is_exclusive() {
        let lock = Arc::new(ChannelLock::new());
        lock.acquire();
        assert!(lock.held_by_current_thread());

        let contender = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            contender.acquire();
            contender.release();
        });

        // The contender must still be blocked on us.
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        lock.release();
        handle.join().unwrap();
        assert!(!lock.held_by_current_thread());
    }

    #[test]
    fn release_by_non_holder_is_ignored() {
        let lock = Arc::new(ChannelLock::new());
        lock.acquire();

        let other = Arc::clone(&lock);
        std::thread::spawn(move || other.release()).join().unwrap();

        assert!(lock.held_by_current_thread());
        lock.release();
    }
}
