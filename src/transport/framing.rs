//! Wire framing for stream transports: a 10-byte ASCII decimal length
//! header followed by exactly that many UTF-8 JSON bytes.

use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header width in bytes.
pub const HEADER_LEN: usize = 10;

/// Upper bound on a single frame body. Keeps a malicious header from
/// forcing an arbitrary allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a message as `header ‖ body` (DTLS sends this as one datagram).
pub fn encode_frame(message: &Value) -> Vec<u8> {
    let body = message.to_string().into_bytes();
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(format!("{:010}", body.len()).as_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Decode a `header ‖ body` buffer (single-datagram transports).
pub fn decode_frame(data: &[u8]) -> io::Result<Value> {
    if data.len() < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame shorter than header",
        ));
    }
    let len = parse_header(&data[..HEADER_LEN])?;
    let body = &data[HEADER_LEN..];
    if body.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame body length {} does not match header {}", body.len(), len),
        ));
    }
    serde_json::from_slice(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write one framed message to a stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Value) -> io::Result<()> {
    let frame = encode_frame(message);
    if frame.len() - HEADER_LEN > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one framed message. `Ok(None)` means the stream closed cleanly at
/// a frame boundary; a desync mid-frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Value>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = parse_header(&header)?;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn parse_header(header: &[u8]) -> io::Result<usize> {
    std::str::from_utf8(header)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid frame header"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut read_half, _keep) = tokio::io::split(server);
        let (_, mut write_half) = tokio::io::split(client);

        let message = json!({"command": "HELLO", "payload": {"node_id": "node-x"}});
        write_frame(&mut write_half, &message).await.unwrap();

        let received = read_frame(&mut read_half).await.unwrap().unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_concatenated_frames_demarcated() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut read_half, _keep) = tokio::io::split(server);
        let (_, mut write_half) = tokio::io::split(client);

        for i in 0..3 {
            write_frame(&mut write_half, &json!({"seq": i})).await.unwrap();
        }
        for i in 0..3 {
            let msg = read_frame(&mut read_half).await.unwrap().unwrap();
            assert_eq!(msg["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_clean_close_returns_none() {
        let (client, server) = tokio::io::duplex(4096);
        drop(client);
        let (mut read_half, _) = tokio::io::split(server);
        assert!(read_frame(&mut read_half).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_header_is_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut read_half, _) = tokio::io::split(server);
        let (_, mut write_half) = tokio::io::split(client);

        write_half.write_all(b"not-a-len").await.unwrap();
        write_half.write_all(b"x").await.unwrap();
        drop(write_half);
        assert!(read_frame(&mut read_half).await.is_err());
    }

    #[test]
    fn test_encode_decode_datagram() {
        let message = json!({"command": "HELLO"});
        let frame = encode_frame(&message);
        assert_eq!(&frame[..HEADER_LEN], format!("{:010}", frame.len() - HEADER_LEN).as_bytes());
        assert_eq!(decode_frame(&frame).unwrap(), message);
        assert!(decode_frame(&frame[..5]).is_err());
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
    }
}
