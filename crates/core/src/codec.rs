//! Length-delimited framing.
//!
//! Every frame is a base-128 varint holding the message length followed by
//! exactly that many bytes of protobuf-encoded message. A stream that closes
//! before the first byte of a frame ended cleanly; a stream that closes
//! anywhere after it produced a truncated frame.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// A u64 varint never needs more than ten bytes.
const MAX_VARINT_LEN: usize = 10;

/// How many offending bytes are quoted in protocol errors.
const DIAGNOSTIC_PREFIX_LEN: usize = 64;

/// Encode `message` as one frame, write it and flush.
pub async fn write_delimited<M, W>(writer: &mut W, message: &M) -> Result<()>
where
    M: Message,
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = message.encode_length_delimited_to_vec();
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it.
///
/// Returns `Ok(None)` when the stream is closed before the frame starts.
/// Frames longer than `max_len` are rejected without reading the body.
pub async fn read_delimited<M, R>(reader: &mut R, max_len: usize) -> Result<Option<M>>
where
    M: Message + Default,
    R: AsyncRead + Unpin + ?Sized,
{
    let Some(len) = read_length_prefix(reader).await? else {
        return Ok(None);
    };

    if len > max_len as u64 {
        return Err(Error::protocol(format!(
            "frame length {} exceeds limit of {} bytes",
            len, max_len
        )));
    }

    let mut buf = vec![0u8; len as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(Error::protocol(format!(
                "truncated frame: expected {} bytes, stream closed after {}: {}",
                len,
                filled,
                printable_prefix(&buf[..filled])
            )));
        }
        filled += n;
    }

    M::decode(buf.as_slice()).map(Some).map_err(|e| {
        Error::protocol(format!(
            "unparseable message ({}): {}",
            e,
            printable_prefix(&buf)
        ))
    })
}

async fn read_length_prefix<R>(reader: &mut R) -> Result<Option<u64>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut seen = Vec::with_capacity(MAX_VARINT_LEN);
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(Error::protocol(format!(
                "truncated length prefix: {}",
                printable_prefix(&seen)
            )));
        }
        let b = byte[0];
        seen.push(b);
        if i == MAX_VARINT_LEN - 1 && b > 1 {
            break;
        }
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(Error::protocol(format!(
        "malformed length prefix: {}",
        printable_prefix(&seen)
    )))
}

fn printable_prefix(bytes: &[u8]) -> String {
    let end = bytes.len().min(DIAGNOSTIC_PREFIX_LEN);
    let text = String::from_utf8_lossy(&bytes[..end]);
    if bytes.len() > end {
        format!("\"{}\"...", text.escape_debug())
    } else {
        format!("\"{}\"", text.escape_debug())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Input, WorkRequest, WorkResponse};

    const LIMIT: usize = 1024 * 1024;

    fn sample_request() -> WorkRequest {
        WorkRequest::new(["testRequest"])
            .with_input(Input::new("testPath", b"testDigest".to_vec()))
            .with_request_id(1)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let request = sample_request();
        let mut buf = Vec::new();
        write_delimited(&mut buf, &request).await.unwrap();

        let mut reader = buf.as_slice();
        let decoded: WorkRequest = read_delimited(&mut reader, LIMIT).await.unwrap().unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let response = WorkResponse::new(1, "test output", 1);
        let mut buf = Vec::new();
        write_delimited(&mut buf, &response).await.unwrap();

        let mut reader = buf.as_slice();
        let decoded: WorkResponse = read_delimited(&mut reader, LIMIT).await.unwrap().unwrap();
        assert_eq!(decoded, response);
    }

    #[tokio::test]
    async fn test_interoperates_with_prost_framing() {
        let request = sample_request();
        let mut buf = Vec::new();
        write_delimited(&mut buf, &request).await.unwrap();
        assert_eq!(WorkRequest::decode_length_delimited(buf.as_slice()).unwrap(), request);

        let response = WorkResponse::new(0, "ok", 3);
        let bytes = response.encode_length_delimited_to_vec();
        let mut reader = bytes.as_slice();
        let decoded: WorkResponse = read_delimited(&mut reader, LIMIT).await.unwrap().unwrap();
        assert_eq!(decoded, response);
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let mut buf = Vec::new();
        write_delimited(&mut buf, &WorkResponse::new(0, "first", 1)).await.unwrap();
        write_delimited(&mut buf, &WorkResponse::new(2, "", 2)).await.unwrap();

        let mut reader = buf.as_slice();
        let first: WorkResponse = read_delimited(&mut reader, LIMIT).await.unwrap().unwrap();
        let second: WorkResponse = read_delimited(&mut reader, LIMIT).await.unwrap().unwrap();
        let end: Option<WorkResponse> = read_delimited(&mut reader, LIMIT).await.unwrap();

        assert_eq!(first.output, "first");
        assert_eq!(second.exit_code, 2);
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_empty_message_frame() {
        // A default response encodes to zero bytes; the frame is just the prefix.
        let mut buf = Vec::new();
        write_delimited(&mut buf, &WorkResponse::default()).await.unwrap();
        assert_eq!(buf, vec![0u8]);

        let mut reader = buf.as_slice();
        let decoded: WorkResponse = read_delimited(&mut reader, LIMIT).await.unwrap().unwrap();
        assert_eq!(decoded, WorkResponse::default());
    }

    #[tokio::test]
    async fn test_clean_end_of_stream() {
        let mut reader: &[u8] = &[];
        let decoded: Option<WorkResponse> = read_delimited(&mut reader, LIMIT).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let bytes = WorkResponse::new(1, "test output", 1).encode_length_delimited_to_vec();
        let mut reader = &bytes[..bytes.len() - 3];
        let err = read_delimited::<WorkResponse, _>(&mut reader, LIMIT)
            .await
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("truncated frame"));
    }

    #[tokio::test]
    async fn test_truncated_length_prefix() {
        let mut reader: &[u8] = &[0x80];
        let err = read_delimited::<WorkResponse, _>(&mut reader, LIMIT)
            .await
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("truncated length prefix"));
    }

    #[tokio::test]
    async fn test_malformed_length_prefix() {
        let bytes = [0xffu8; 11];
        let mut reader = &bytes[..];
        let err = read_delimited::<WorkResponse, _>(&mut reader, LIMIT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("malformed length prefix"));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let bytes = WorkResponse::new(0, "x".repeat(100), 0).encode_length_delimited_to_vec();
        let mut reader = bytes.as_slice();
        let err = read_delimited::<WorkResponse, _>(&mut reader, 16)
            .await
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn test_log_line_on_stdout_is_protocol_error() {
        // 'H' reads as a 72-byte length; the rest of the line is too short.
        let mut reader: &[u8] = b"Hello from the worker\n";
        let err = read_delimited::<WorkResponse, _>(&mut reader, LIMIT)
            .await
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("ello from the worker"));
    }

    #[tokio::test]
    async fn test_unparseable_body() {
        let bytes = [0x03u8, 0xff, 0xff, 0xff];
        let mut reader = &bytes[..];
        let err = read_delimited::<WorkResponse, _>(&mut reader, LIMIT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unparseable message"));
    }
}
