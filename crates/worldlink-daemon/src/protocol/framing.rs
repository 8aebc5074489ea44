//! Varint length-prefixed framing.
//!
//! Every message on the simulator socket is a protobuf payload preceded by
//! its length, written as a base-128 varint:
//!
//! ```text
//! +---------------------------+------------------------+
//! | Length (varint32, 1-5 B)  | Payload (protobuf)     |
//! +---------------------------+------------------------+
//! ```
//!
//! Groups are little-endian; the high bit of each byte marks continuation.
//! A prefix that has not terminated after five bytes is a framing error.
//!
//! Two interfaces are provided:
//!
//! - [`FrameCodec`]: a `tokio_util` codec used by the long-lived reader and
//!   writer halves of a session.
//! - [`decode_length`] / [`read_exact`] / [`write_frame`]: direct stream
//!   helpers used for the handshake, where exactly one frame is read and no
//!   bytes beyond it may be buffered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, ProtocolResult, from_read_error};

/// Longest valid encoding of a 32-bit varint.
pub const MAX_VARINT32_LEN: usize = 5;

/// Appends `value` as a varint to `dst`.
pub fn encode_varint32(mut value: u32, dst: &mut BytesMut) {
    while value >= 0x80 {
        // Truncation keeps the low seven bits plus the continuation flag.
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    #[allow(clippy::cast_possible_truncation)]
    dst.put_u8(value as u8);
}

/// Prepends the varint length of `payload` and returns the complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the payload length does not fit
/// in 32 bits.
pub fn encode_frame(payload: &[u8]) -> ProtocolResult<Bytes> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::frame_too_large(payload.len(), u32::MAX as usize))?;
    let mut frame = BytesMut::with_capacity(MAX_VARINT32_LEN + payload.len());
    encode_varint32(len, &mut frame);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

/// Parses a varint at the start of `buf` without consuming it.
///
/// Returns `Ok(None)` if more bytes are needed, or the value together with
/// the number of prefix bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidFrame`] if the prefix runs past five bytes
/// or its value overflows 32 bits.
pub fn parse_varint32(buf: &[u8]) -> ProtocolResult<Option<(u32, usize)>> {
    let mut value: u32 = 0;
    for (index, byte) in buf.iter().copied().take(MAX_VARINT32_LEN).enumerate() {
        push_varint_byte(&mut value, index, byte)?;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    if buf.len() >= MAX_VARINT32_LEN {
        return Err(varint_too_long());
    }
    Ok(None)
}

fn push_varint_byte(value: &mut u32, index: usize, byte: u8) -> ProtocolResult<()> {
    let bits = u32::from(byte & 0x7f);
    if index == MAX_VARINT32_LEN - 1 && bits > 0x0f {
        return Err(ProtocolError::invalid_frame("varint32 length overflows 32 bits"));
    }
    *value |= bits << (7 * index);
    Ok(())
}

fn varint_too_long() -> ProtocolError {
    ProtocolError::invalid_frame(format!(
        "varint32 length did not terminate within {MAX_VARINT32_LEN} bytes"
    ))
}

/// Reads one varint length prefix from `reader`.
///
/// # Errors
///
/// - [`ProtocolError::ConnectionClosed`] if the stream ends first
/// - [`ProtocolError::InvalidFrame`] if the prefix is malformed
pub async fn decode_length<R>(reader: &mut R) -> ProtocolResult<u32>
where
    R: AsyncRead + Unpin,
{
    let mut value: u32 = 0;
    for index in 0..MAX_VARINT32_LEN {
        let byte = reader.read_u8().await.map_err(from_read_error)?;
        push_varint_byte(&mut value, index, byte)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(varint_too_long())
}

/// Reads exactly `len` bytes from `reader`.
///
/// # Errors
///
/// Returns [`ProtocolError::ConnectionClosed`] on a short read.
pub async fn read_exact<R>(reader: &mut R, len: usize) -> ProtocolResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(from_read_error)?;
    Ok(buf)
}

/// Reads one complete frame, rejecting anything longer than `max_len`.
///
/// # Errors
///
/// Propagates errors from [`decode_length`] and [`read_exact`], and returns
/// [`ProtocolError::FrameTooLarge`] before allocating an oversized payload.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> ProtocolResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = decode_length(reader).await? as usize;
    if len > max_len {
        return Err(ProtocolError::frame_too_large(len, max_len));
    }
    read_exact(reader, len).await
}

/// Writes `payload` as one frame and flushes.
///
/// # Errors
///
/// Returns an error if the payload is too large or the write fails.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Codec for varint length-prefixed frames.
///
/// Frames larger than the configured maximum are rejected from the prefix
/// alone, before the payload is buffered.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec with the given frame size limit.
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Returns the frame size limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(worldlink_core::config::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((len, prefix_len)) = parse_varint32(src)? else {
            return Ok(None);
        };
        let len = len as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(len, self.max_frame_size));
        }

        let total = prefix_len + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(
                item.len(),
                self.max_frame_size,
            ));
        }
        let len = u32::try_from(item.len())
            .map_err(|_| ProtocolError::frame_too_large(item.len(), u32::MAX as usize))?;
        dst.reserve(MAX_VARINT32_LEN + item.len());
        encode_varint32(len, dst);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn test_varint_known_encodings() {
        let cases: [(u32, &[u8]); 5] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (300, &[0xac, 0x02]),
            (u32::MAX, &[0xff, 0xff, 0xff, 0xff, 0x0f]),
        ];
        for (value, expected) in cases {
            let mut buf = BytesMut::new();
            encode_varint32(value, &mut buf);
            assert_eq!(&buf[..], expected, "encoding of {value}");
            assert_eq!(
                parse_varint32(expected).unwrap(),
                Some((value, expected.len()))
            );
        }
    }

    #[test]
    fn test_parse_needs_more_bytes() {
        assert_eq!(parse_varint32(&[]).unwrap(), None);
        assert_eq!(parse_varint32(&[0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_six_byte_prefix() {
        let err = parse_varint32(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).unwrap_err();
        assert!(err.is_framing_error());
    }

    #[test]
    fn test_parse_rejects_overflowing_fifth_byte() {
        let err = parse_varint32(&[0xff, 0xff, 0xff, 0xff, 0x1f]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame { .. }));
    }

    #[tokio::test]
    async fn test_decode_length_rejects_unterminated_prefix() {
        let mut stream: &[u8] = &[0xff; 8];
        let err = decode_length(&mut stream).await.unwrap_err();
        assert!(err.is_framing_error());
    }

    #[tokio::test]
    async fn test_decode_length_on_empty_stream_is_closed() {
        let mut stream: &[u8] = &[];
        let err = decode_length(&mut stream).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_exact_short_read_is_closed() {
        let mut stream: &[u8] = &[1, 2, 3];
        let err = read_exact(&mut stream, 10).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_frame_enforces_limit() {
        let frame = encode_frame(&[7u8; 100]).unwrap();
        let mut stream: &[u8] = &frame;
        let err = read_frame(&mut stream, 64).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge { size: 100, max: 64 }
        ));
    }

    #[tokio::test]
    async fn test_write_frame_then_read_frame() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").await.unwrap();
        write_frame(&mut wire, b"").await.unwrap();

        let mut stream: &[u8] = &wire;
        assert_eq!(read_frame(&mut stream, 1024).await.unwrap(), b"hello");
        assert_eq!(read_frame(&mut stream, 1024).await.unwrap(), b"");
        assert!(stream.is_empty());
    }

    #[test]
    fn test_codec_decodes_split_frames() {
        let mut codec = FrameCodec::new(1024);
        let frame = encode_frame(&[9u8; 200]).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[1..50]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[50..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.len(), 200);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_decodes_back_to_back_frames() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"two"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "one");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "two");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized_prefix_before_payload() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        encode_varint32(17, &mut buf);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 17, max: 16 }));
    }

    #[test]
    fn test_codec_encoder_rejects_oversized_payload() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Bytes::from_static(b"too long"), &mut buf)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_eof_mid_frame_is_closed() {
        let mut codec = FrameCodec::new(1024);
        let frame = encode_frame(b"partial").unwrap();
        let mut buf = BytesMut::from(&frame[..4]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    proptest! {
        /// `decode_length` followed by `read_exact` reproduces every payload
        /// produced by `encode_frame`.
        #[test]
        fn prop_frame_round_trip(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
            let frame = encode_frame(&payload).unwrap();
            let decoded = block_on(async {
                let mut stream: &[u8] = &frame;
                let len = decode_length(&mut stream).await.unwrap();
                let body = read_exact(&mut stream, len as usize).await.unwrap();
                (body, stream.len())
            });
            prop_assert_eq!(decoded.0, payload);
            prop_assert_eq!(decoded.1, 0);
        }

        /// Every `u32` encodes in at most five bytes and parses back.
        #[test]
        fn prop_varint_bounded(value in any::<u32>()) {
            let mut buf = BytesMut::new();
            encode_varint32(value, &mut buf);
            prop_assert!(buf.len() <= MAX_VARINT32_LEN);
            prop_assert_eq!(parse_varint32(&buf).unwrap(), Some((value, buf.len())));
        }
    }
}
