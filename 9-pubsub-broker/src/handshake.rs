use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HandshakeError;

/// Literal reply for an accepted handshake.
pub const ACK: &[u8] = b"OK";

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Publisher,
    Subscriber,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Subscriber => f.write_str("subscriber"),
        }
    }
}

/// The one message every client sends right after connecting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeFrame {
    #[serde(rename = "ClientType")]
    pub client_type: Role,
}

/// Loose view of the frame so a missing or unknown `ClientType` can be told
/// apart from broken JSON.
#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "ClientType")]
    client_type: Option<String>,
}

/// Result of a successful handshake read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub role: Role,
    /// Bytes that followed the JSON object in the same reads.
    pub leftover: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct HandshakeLimits {
    pub max_frame_bytes: usize,
    pub timeout: Duration,
}

impl Default for HandshakeLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Reads and classifies the handshake frame.
///
/// There is no delimiter on the wire, so reads are accumulated until the
/// buffer holds one complete JSON value. Both the byte count and the total
/// wait are bounded by `limits`.
pub async fn read_handshake<R>(
    reader: &mut R,
    limits: &HandshakeLimits,
) -> Result<Handshake, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(limits.timeout, read_frame(reader, limits.max_frame_bytes))
        .await
        .map_err(|_| HandshakeError::Timeout(limits.timeout))?
}

async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Handshake, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(max_frame_bytes);
    let mut chunk = vec![0u8; max_frame_bytes];

    loop {
        let remaining = max_frame_bytes - buffer.len();
        if remaining == 0 {
            return Err(HandshakeError::FrameTooLarge {
                limit: max_frame_bytes,
            });
        }

        let read = reader.read(&mut chunk[..remaining]).await?;
        if read == 0 {
            return Err(HandshakeError::Closed);
        }
        buffer.extend_from_slice(&chunk[..read]);

        if let Some(handshake) = parse_frame(&buffer)? {
            return Ok(handshake);
        }
    }
}

/// Returns `Ok(None)` while the buffer holds only a prefix of a JSON value.
fn parse_frame(buffer: &[u8]) -> Result<Option<Handshake>, HandshakeError> {
    let mut values = serde_json::Deserializer::from_slice(buffer).into_iter::<RawFrame>();

    match values.next() {
        None => Ok(None),
        Some(Err(err)) if err.is_eof() => Ok(None),
        Some(Err(err)) => Err(HandshakeError::Malformed(err)),
        Some(Ok(raw)) => {
            let consumed = values.byte_offset();
            let role = classify(raw)?;
            Ok(Some(Handshake {
                role,
                leftover: buffer[consumed..].to_vec(),
            }))
        }
    }
}

fn classify(raw: RawFrame) -> Result<Role, HandshakeError> {
    match raw.client_type.as_deref() {
        Some("PUBLISHER") => Ok(Role::Publisher),
        Some("SUBSCRIBER") => Ok(Role::Subscriber),
        Some(other) => Err(HandshakeError::UnknownClientType(other.to_string())),
        None => Err(HandshakeError::MissingClientType),
    }
}

pub async fn acknowledge<W>(writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(ACK).await?;
    writer.flush().await
}

pub async fn send_handshake<W>(writer: &mut W, role: Role) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let frame = HandshakeFrame { client_type: role };
    let encoded = serde_json::to_vec(&frame).map_err(HandshakeError::Encode)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Client side: waits for the broker's `OK`. A close or any other reply
/// means the handshake was refused.
pub async fn await_ack<R>(reader: &mut R) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut reply = [0u8; 2];
    match reader.read_exact(&mut reply).await {
        Ok(_) if reply == ACK => Ok(()),
        Ok(_) => Err(HandshakeError::Rejected),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(HandshakeError::Rejected)
        }
        Err(err) => Err(err.into()),
    }
}
