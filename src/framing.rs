//! Length-prefixed message framing.
//!
//! Both the tunnel daemon socket and the control-channel session carry
//! discrete messages over a byte stream:
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)]
//! [N bytes: payload]
//! ```
//!
//! The payload encoding is chosen by the caller: bincode for the daemon,
//! JSON for the control channel.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors from frame I/O.
#[derive(Debug, Error)]
pub enum FrameError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Bincode encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),
    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The peer closed the stream.
    #[error("Connection closed")]
    ConnectionClosed,
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("Frame too large: {0} bytes (max {1})")]
    TooLarge(usize, usize),
}

/// Result type for framing operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Read one raw frame.
///
/// A clean EOF before the length prefix is reported as
/// [`FrameError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R) -> FrameResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len, MAX_FRAME_SIZE));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one raw frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> FrameResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len(), MAX_FRAME_SIZE));
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a bincode-encoded message.
pub async fn read_bincode<R, T>(reader: &mut R) -> FrameResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(reader).await?;
    Ok(bincode::deserialize(&payload)?)
}

/// Write a bincode-encoded message.
pub async fn write_bincode<W, T>(writer: &mut W, msg: &T) -> FrameResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(msg)?;
    write_frame(writer, &payload).await
}

/// Read a JSON-encoded message.
pub async fn read_json<R, T>(reader: &mut R) -> FrameResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(reader).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Write a JSON-encoded message.
pub async fn write_json<W, T>(writer: &mut W, msg: &T) -> FrameResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg)?;
    write_frame(writer, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        note: String,
    }

    #[tokio::test]
    async fn test_bincode_frames_across_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let sent = Ping {
            seq: 9,
            note: "hello".to_string(),
        };
        write_bincode(&mut client, &sent).await.unwrap();
        let received: Ping = read_bincode(&mut server).await.unwrap();

        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_clean_eof_is_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(FrameError::TooLarge(_, MAX_FRAME_SIZE))));
    }

    #[tokio::test]
    async fn test_malformed_json_is_decode_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"{not json").await.unwrap();

        let result: FrameResult<Ping> = read_json(&mut server).await;
        assert!(matches!(result, Err(FrameError::Json(_))));
    }
}
