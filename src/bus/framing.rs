//! Length-prefixed message framing for the TCP event bus bridge.
//!
//! Every frame on the wire is a 4-byte big-endian unsigned length followed by
//! exactly that many bytes of UTF-8 JSON text.
//!
//! # Wire Format
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| JSON payload (length bytes)|
//! +----------------+---------------------------+
//! ```
//!
//! Short reads are normal: the decoder keeps buffering until a whole frame is
//! available. Only end-of-stream is treated as a failure.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame payload (100MB) to prevent OOM from malicious/buggy bridges.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Initial capacity of the read buffer.
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Encode a payload as a single frame.
///
/// # Errors
///
/// Returns `ErrorKind::InvalidInput` if the payload does not fit a 32-bit
/// length prefix.
pub fn encode_frame(payload: &str) -> io::Result<Vec<u8>> {
    let bytes = payload.as_bytes();
    let len = u32::try_from(bytes.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Frame payload of {} bytes exceeds u32 length prefix", bytes.len()),
        )
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + bytes.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(bytes);
    Ok(frame)
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed (including a partial length
/// prefix). On success the frame bytes are consumed from `buf`; any bytes of
/// the following frame stay buffered.
///
/// # Errors
///
/// Returns `ErrorKind::InvalidData` if the declared length exceeds
/// `max_frame_size` or the payload is not valid UTF-8.
pub fn decode_frame(buf: &mut Vec<u8>, max_frame_size: usize) -> io::Result<Option<String>> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
    let size = u32::from_be_bytes(prefix) as usize;

    if size > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds maximum {} bytes", size, max_frame_size),
        ));
    }

    let total = LENGTH_PREFIX_SIZE + size;
    if buf.len() < total {
        return Ok(None);
    }

    let payload: Vec<u8> = buf.drain(..total).skip(LENGTH_PREFIX_SIZE).collect();
    String::from_utf8(payload).map(Some).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame payload is not valid UTF-8: {}", e),
        )
    })
}

/// Buffered frame reader over any async byte stream.
///
/// The buffer lives in the reader, so `next_frame` is cancel-safe: dropping
/// the future between reads never loses bytes of a partially received frame.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_BUFFER_CAPACITY),
            max_frame_size,
        }
    }

    /// Read the next complete frame payload.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The stream is closed (`ErrorKind::UnexpectedEof`)
    /// - The declared length exceeds the configured maximum
    /// - The payload is not valid UTF-8
    /// - The underlying read fails
    pub async fn next_frame(&mut self) -> io::Result<String> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.max_frame_size)? {
                return Ok(frame);
            }

            let bytes_read = self.inner.read_buf(&mut self.buf).await?;

            // EOF - connection closed
            if bytes_read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed by bridge",
                ));
            }
        }
    }
}

/// Write a single length-prefixed frame and flush it.
///
/// The whole frame is assembled before writing so concurrent writers that
/// serialize on the stream never interleave partial frames.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &str) -> io::Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_encode_prefixes_big_endian_length() {
        let frame = encode_frame(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 15]);
        assert_eq!(&frame[4..], br#"{"type":"ping"}"#);
    }

    #[test]
    fn test_encode_counts_utf8_bytes_not_chars() {
        let frame = encode_frame("héllo").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 6]);
    }

    #[test]
    fn test_decode_waits_for_length_prefix() {
        let mut buf = vec![0, 0];
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_decode_waits_for_full_payload() {
        let mut buf = encode_frame("abcdef").unwrap();
        buf.truncate(7);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn test_decode_leaves_following_frame_buffered() {
        let mut buf = encode_frame("first").unwrap();
        buf.extend(encode_frame("second").unwrap());

        let first = decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(first.as_deref(), Some("first"));
        let second = decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(second.as_deref(), Some("second"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_accepts_empty_payload() {
        let mut buf = vec![0, 0, 0, 0];
        assert_eq!(
            decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().as_deref(),
            Some("")
        );
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut buf = 1025u32.to_be_bytes().to_vec();
        let err = decode_frame(&mut buf, 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(
            err.to_string().contains("exceeds maximum"),
            "Expected size error, got: {}",
            err
        );
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let mut buf = vec![0, 0, 0, 2, 0xff, 0xfe];
        let err = decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (mut client, server) = duplex(64);
        let message = r#"{"type":"send","address":"test.echo","body":{"foo":"bar"}}"#;

        write_frame(&mut client, message).await.expect("Write failed");

        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_SIZE);
        let received = timeout(TEST_TIMEOUT, reader.next_frame())
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_reader_reassembles_split_writes() {
        let (mut client, server) = duplex(64);
        let frame = encode_frame(r#"{"type":"pong"}"#).unwrap();

        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(3) {
                client.write_all(chunk).await.unwrap();
                client.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            client
        });

        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_SIZE);
        let received = timeout(TEST_TIMEOUT, reader.next_frame())
            .await
            .expect("Test timed out")
            .expect("Read failed");
        assert_eq!(received, r#"{"type":"pong"}"#);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_reader_yields_back_to_back_frames() {
        let (mut client, server) = duplex(256);
        let mut bytes = encode_frame("one").unwrap();
        bytes.extend(encode_frame("two").unwrap());
        client.write_all(&bytes).await.unwrap();

        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(reader.next_frame().await.unwrap(), "one");
        assert_eq!(reader.next_frame().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_connection_closed_returns_error() {
        let (client, server) = duplex(64);

        // Close write end immediately without sending anything
        drop(client);

        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_SIZE);
        let result = timeout(TEST_TIMEOUT, reader.next_frame())
            .await
            .expect("Test timed out");

        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_truncated_frame_then_close_is_an_error() {
        let (mut client, server) = duplex(64);
        let frame = encode_frame("truncated").unwrap();
        client.write_all(&frame[..6]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_SIZE);
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
