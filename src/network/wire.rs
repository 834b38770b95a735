//! Length-prefixed framing for signed envelopes.
//!
//! Frame format: [4-byte length (u32 big-endian)][bincode SignedEnvelope]
//! Maximum frame size: 4MB (prevents memory exhaustion attacks)
//!
//! Frames are handled as raw bytes here; decoding and verification happen
//! in the security gate so the byte count can be charged first.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame size (4MB)
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Prefix `body` with its length, ready to be written as one frame.
pub fn encode_frame(body: &[u8]) -> Result<Bytes, String> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            format!(
                "Message too large: {} bytes (max: {})",
                body.len(),
                MAX_FRAME_SIZE
            )
        })?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(Bytes::from(frame))
}

/// Write a pre-encoded frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), String> {
    writer
        .write_all(frame)
        .await
        .map_err(|e| format!("Failed to write frame: {}", e))?;

    writer
        .flush()
        .await
        .map_err(|e| format!("Failed to flush: {}", e))?;

    Ok(())
}

/// Read one frame body.
/// Returns Ok(None) on clean EOF (connection closed).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, String> {
    // Read 4-byte length prefix
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(format!("Failed to read frame length: {}", e)),
    }

    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_SIZE {
        return Err(format!(
            "Frame too large: {} bytes (max: {})",
            len, MAX_FRAME_SIZE
        ));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| format!("Failed to read frame payload: {}", e))?;

    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let frame = encode_frame(b"envelope bytes").unwrap();
        assert_eq!(&frame[..4], &14u32.to_be_bytes());

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let body = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(body, b"envelope bytes");
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = std::io::Cursor::new(len.to_vec());
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_truncated_body_is_error() {
        let mut data = 10u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"short");
        let mut cursor = std::io::Cursor::new(data);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
