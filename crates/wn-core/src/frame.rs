//! Frame parsing and serialization.
//!
//! Every sub-stream starts with exactly one control frame that negotiates its
//! purpose. Frames are self-delimiting:
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────┬─────────┬─────────┐
//! │ type: u32    │ command_len: u32 │ payload_len: u32 │ command │ payload │
//! └──────────────┴──────────────────┴──────────────────┴─────────┴─────────┘
//!   4 bytes        4 bytes            4 bytes            n bytes   m bytes
//! ```
//!
//! All multi-byte integers use little-endian byte order. A frame is written
//! with a single `write_all` so its header is never interleaved with bytes of
//! another frame.

use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 12;

/// Type identifier for init frames (0x01).
pub const TYPE_INIT: u32 = 0x01;
/// Type identifier for permission frames (0x02).
pub const TYPE_PERM: u32 = 0x02;
/// Type identifier for acknowledgment frames (0x03).
pub const TYPE_RECV: u32 = 0x03;
/// Type identifier for error frames (0x04).
pub const TYPE_ERR: u32 = 0x04;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameType {
    /// Session-level control exchange.
    Init = TYPE_INIT,
    /// Request to open a named stream; payload is the auth token.
    Perm = TYPE_PERM,
    /// Positive acknowledgment of a permission request.
    Recv = TYPE_RECV,
    /// Failure signal; command is an error code, payload a detail message.
    Err = TYPE_ERR,
}

impl FrameType {
    /// Convert to wire format.
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Convert from wire format.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            TYPE_INIT => Some(Self::Init),
            TYPE_PERM => Some(Self::Perm),
            TYPE_RECV => Some(Self::Recv),
            TYPE_ERR => Some(Self::Err),
            _ => None,
        }
    }
}

/// Upper bounds applied while decoding untrusted input.
///
/// The codec itself imposes no limits; sessions decode with these so a peer
/// cannot make us allocate gigabytes from a forged header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Maximum command length in bytes.
    pub max_command_len: usize,
    /// Maximum payload length in bytes.
    pub max_payload_len: usize,
}

impl FrameLimits {
    /// No limits beyond what fits in the length fields.
    pub const UNBOUNDED: Self = Self {
        max_command_len: u32::MAX as usize,
        max_payload_len: u32::MAX as usize,
    };
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_command_len: 255,
            max_payload_len: 64 * 1024,
        }
    }
}

/// One control message: type, command and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    command: String,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame.
    pub fn new(
        frame_type: FrameType,
        command: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            frame_type,
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Permission request for `name` carrying `token`.
    pub fn perm(name: impl Into<String>, token: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameType::Perm, name, token)
    }

    /// Acknowledgment of a permission request for `name`.
    pub fn recv(name: impl Into<String>) -> Self {
        Self::new(FrameType::Recv, name, Vec::new())
    }

    /// Error frame with an error `code` and a detail message.
    pub fn err(code: impl Into<String>, detail: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameType::Err, code, detail)
    }

    /// Frame type tag.
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Command string (stream name or error code).
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, returning command and payload.
    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.command, self.payload)
    }

    /// Whether this is an init frame.
    pub fn is_init_frame(&self) -> bool {
        self.frame_type == FrameType::Init
    }

    /// Whether this is a permission frame.
    pub fn is_perm_frame(&self) -> bool {
        self.frame_type == FrameType::Perm
    }

    /// Whether this is an acknowledgment frame.
    pub fn is_recv_frame(&self) -> bool {
        self.frame_type == FrameType::Recv
    }

    /// Whether this is an error frame.
    pub fn is_err_frame(&self) -> bool {
        self.frame_type == FrameType::Err
    }

    /// Exact number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.command.len() + self.payload.len()
    }

    /// Serialize frame to bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let command_len = u32::try_from(self.command.len())
            .map_err(|_| Error::InvalidFrame("command exceeds u32::MAX bytes".into()))?;
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| Error::InvalidFrame("payload exceeds u32::MAX bytes".into()))?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.frame_type.to_u32().to_le_bytes());
        buf.extend_from_slice(&command_len.to_le_bytes());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(self.command.as_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse one frame from the front of `data`.
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        check_len(data, HEADER_LEN)?;
        let header = Header::parse(&data[..HEADER_LEN])?;

        let (command_end, frame_end) = header.ends()?;
        check_len(data, command_end)?;
        check_len(data, frame_end)?;

        let command = decode_command(data[HEADER_LEN..command_end].to_vec())?;
        let payload = data[command_end..frame_end].to_vec();

        Ok((
            Frame {
                frame_type: header.frame_type,
                command,
                payload,
            },
            frame_end,
        ))
    }

    /// Write the frame as one logical write.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let data = self.serialize()?;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame without length limits.
    ///
    /// Returns `Ok(None)` if the stream ends before the first header byte.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        Self::read_limited(reader, FrameLimits::UNBOUNDED).await
    }

    /// Read one frame, rejecting fields longer than `limits` before
    /// allocating for them.
    pub async fn read_limited<R>(reader: &mut R, limits: FrameLimits) -> Result<Option<Self>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header_buf = [0u8; HEADER_LEN];
        let first = reader.read(&mut header_buf).await?;
        if first == 0 {
            return Ok(None);
        }
        read_exact_or_truncated(reader, &mut header_buf[first..], HEADER_LEN).await?;

        let header = Header::parse(&header_buf)?;
        if header.command_len > limits.max_command_len {
            return Err(Error::InvalidFrame(format!(
                "command length {} exceeds limit {}",
                header.command_len, limits.max_command_len
            )));
        }
        if header.payload_len > limits.max_payload_len {
            return Err(Error::InvalidFrame(format!(
                "payload length {} exceeds limit {}",
                header.payload_len, limits.max_payload_len
            )));
        }

        let (command_end, frame_end) = header.ends()?;
        let mut command = vec![0u8; header.command_len];
        read_exact_or_truncated(reader, &mut command, command_end).await?;

        let mut payload = vec![0u8; header.payload_len];
        read_exact_or_truncated(reader, &mut payload, frame_end).await?;

        Ok(Some(Frame {
            frame_type: header.frame_type,
            command: decode_command(command)?,
            payload,
        }))
    }
}

struct Header {
    frame_type: FrameType,
    command_len: usize,
    payload_len: usize,
}

impl Header {
    fn parse(data: &[u8]) -> Result<Self> {
        let type_tag = read_u32_le(&data[0..4]);
        let frame_type = FrameType::from_u32(type_tag)
            .ok_or_else(|| Error::InvalidFrame(format!("Unknown frame type 0x{type_tag:08X}")))?;
        Ok(Self {
            frame_type,
            command_len: read_u32_le(&data[4..8]) as usize,
            payload_len: read_u32_le(&data[8..12]) as usize,
        })
    }

    /// Offsets where the command and the whole frame end.
    fn ends(&self) -> Result<(usize, usize)> {
        let overflow = || Error::InvalidFrame("frame length overflows usize".into());
        let command_end = HEADER_LEN
            .checked_add(self.command_len)
            .ok_or_else(overflow)?;
        let frame_end = command_end
            .checked_add(self.payload_len)
            .ok_or_else(overflow)?;
        Ok((command_end, frame_end))
    }
}

async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8], needed: usize) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::InsufficientData(needed))
        }
        Err(e) => Err(Error::Io(e)),
    }
}

fn decode_command(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| Error::InvalidFrame("command is not valid UTF-8".into()))
}

fn check_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(Error::InsufficientData(needed))
    } else {
        Ok(())
    }
}

#[inline]
fn read_u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perm_frame_roundtrip() {
        let frame = Frame::perm("files", b"secret".to_vec());

        let serialized = frame.serialize().expect("serialize failed");
        assert_eq!(serialized.len(), HEADER_LEN + 5 + 6);

        let (parsed, used) = Frame::parse(&serialized).expect("parse failed");
        assert_eq!(parsed, frame);
        assert_eq!(used, serialized.len());
    }

    #[test]
    fn test_header_length_overflow_is_invalid() {
        let header = Header {
            frame_type: FrameType::Perm,
            command_len: usize::MAX - HEADER_LEN,
            payload_len: 1,
        };
        assert!(matches!(header.ends(), Err(Error::InvalidFrame(_))));

        let header = Header {
            frame_type: FrameType::Perm,
            command_len: usize::MAX,
            payload_len: 0,
        };
        assert!(matches!(header.ends(), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_parse_max_lengths_does_not_panic() {
        let mut data = Vec::new();
        data.extend_from_slice(&TYPE_PERM.to_le_bytes());
        data.extend_from_slice(&u32::MAX.to_le_bytes());
        data.extend_from_slice(&u32::MAX.to_le_bytes());
        data.extend_from_slice(b"short");
        assert!(Frame::parse(&data).is_err());
    }

    #[test]
    fn test_parse_unknown_type() {
        let mut bytes = Frame::recv("x").serialize().unwrap();
        bytes[0] = 0x7F;
        assert!(matches!(Frame::parse(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_parse_rejects_invalid_utf8_command() {
        let mut bytes = Frame::perm("ab", Vec::new()).serialize().unwrap();
        bytes[HEADER_LEN] = 0xFF;
        assert!(matches!(Frame::parse(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_parse_leaves_trailing_bytes() {
        let mut bytes = Frame::recv("echo").serialize().unwrap();
        let first_len = bytes.len();
        bytes.extend_from_slice(b"application data");

        let (frame, used) = Frame::parse(&bytes).unwrap();
        assert!(frame.is_recv_frame());
        assert_eq!(used, first_len);
        assert_eq!(&bytes[used..], b"application data");
    }

    #[tokio::test]
    async fn test_read_from_empty_stream() {
        let mut empty: &[u8] = &[];
        let frame = Frame::read_from(&mut empty).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_read_limited_rejects_large_payload() {
        let bytes = Frame::perm("files", vec![0u8; 2048]).serialize().unwrap();
        let limits = FrameLimits {
            max_command_len: 16,
            max_payload_len: 1024,
        };
        let mut reader = bytes.as_slice();
        let err = Frame::read_limited(&mut reader, limits).await.unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
    }

    #[tokio::test]
    async fn test_write_then_read_leaves_remaining_bytes() {
        let (mut a, mut b) = tokio::io::duplex(256);
        Frame::recv("echo").write_to(&mut a).await.unwrap();
        a.write_all(b"tail").await.unwrap();
        drop(a);

        let frame = Frame::read_from(&mut b).await.unwrap().unwrap();
        assert_eq!(frame.command(), "echo");

        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"tail");
    }
}
