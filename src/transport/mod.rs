//! Transport layer for service ↔ child communication.
//!
//! Length-prefixed JSON framing over the child's stdin/stdout pipes. The
//! async functions serve the process boundary; the blocking ones serve the
//! thread boundary, which drives the child from a plain worker thread.

pub mod protocol;

pub use protocol::{ChildMessage, ChildOutcome, ChildReport, ChildRequest, Stream};

use std::io::{ErrorKind, Read, Write};

use anyhow::Result;

/// Maximum message size (64 MB). Safety valve against malformed messages.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

fn frame_len(payload: &[u8]) -> Result<[u8; 4]> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Message too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );
    Ok(len.to_be_bytes())
}

fn payload_len(header: [u8; 4]) -> Result<usize> {
    let len = u32::from_be_bytes(header);
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );
    Ok(len as usize)
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let header = frame_len(payload)?;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns `None` once the writer has gone away. A frame cut short by the
/// writer dying counts as gone away too: a killed child cannot finish its
/// last frame. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut buf = vec![0u8; payload_len(header)?];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(Some(buf)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Blocking counterpart of [`send_message`].
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let header = frame_len(payload)?;
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Blocking counterpart of [`recv_message`].
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut buf = vec![0u8; payload_len(header)?];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(buf)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceBuilder;
    use crate::registry::Registry;

    #[tokio::test]
    async fn roundtrip_framing() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        send_message(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap();
        assert_eq!(received.as_deref(), Some(&payload[..]));
        // Clean end of stream
        assert!(recv_message(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_payload() {
        let mut buf = Vec::new();
        send_message(&mut buf, b"").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap().unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn truncated_frame_is_end_of_stream() {
        let mut buf = Vec::new();
        send_message(&mut buf, b"complete frame").await.unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(recv_message(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frame_split_across_reads() {
        let mut framed = Vec::new();
        send_message(&mut framed, br#"{"type":"report"}"#).await.unwrap();

        let mut reader = tokio_test::io::Builder::new()
            .read(&framed[..2])
            .read(&framed[2..7])
            .read(&framed[7..])
            .build();
        let received = recv_message(&mut reader).await.unwrap();
        assert_eq!(received.as_deref(), Some(&br#"{"type":"report"}"#[..]));
    }

    #[tokio::test]
    async fn oversized_header_rejected() {
        let buf = (MAX_MESSAGE_SIZE + 1).to_be_bytes().to_vec();
        let mut cursor = std::io::Cursor::new(buf);
        let err = recv_message(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("exceeds max size"));
    }

    #[test]
    fn blocking_framing_interoperates() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"one").unwrap();
        write_frame(&mut buf, b"two").unwrap();

        let mut reader = &buf[..];
        assert_eq!(read_frame(&mut reader).unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(read_frame(&mut reader).unwrap().as_deref(), Some(&b"two"[..]));
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn protocol_serialize_request() {
        let registry = Registry::default();
        let req = ChildRequest {
            code: "print(42)".to_string(),
            namespace: NamespaceBuilder::new(&registry).build(&serde_json::Map::new()),
            capture_locals: true,
            max_stream_bytes: 1024,
            max_locals_bytes: 2048,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["code"], "print(42)");
        assert_eq!(json["capture_locals"], true);
        assert!(json["namespace"]["builtins"]
            .as_array()
            .unwrap()
            .iter()
            .any(|b| b == "print"));
        assert_eq!(json["namespace"]["modules"][0]["alias"], "np");
    }

    #[test]
    fn protocol_deserialize_output() {
        let json = r#"{"type":"output","stream":"stdout","data":"hi\n"}"#;
        let msg: ChildMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ChildMessage::Output {
                stream: Stream::Stdout,
                data: "hi\n".into(),
                overflow: false
            }
        );
    }

    #[test]
    fn protocol_deserialize_report() {
        let json = r#"{
            "type": "report",
            "outcome": {"status": "raised", "exc_type": "ZeroDivisionError", "message": "division by zero"},
            "locals": null,
            "peak_rss_kb": 10240,
            "unavailable_modules": ["pandas"]
        }"#;
        let msg: ChildMessage = serde_json::from_str(json).unwrap();
        let ChildMessage::Report(report) = msg else {
            panic!("expected a report");
        };
        assert_eq!(
            report.outcome,
            ChildOutcome::Raised {
                exc_type: "ZeroDivisionError".into(),
                message: "division by zero".into()
            }
        );
        assert_eq!(report.peak_rss_kb, Some(10240));
        assert_eq!(report.unavailable_modules, ["pandas"]);
    }

    #[test]
    fn protocol_deserialize_minimal_report() {
        let json = r#"{"type":"report","outcome":{"status":"syntax_invalid","message":"invalid syntax","line":3}}"#;
        let msg: ChildMessage = serde_json::from_str(json).unwrap();
        let ChildMessage::Report(report) = msg else {
            panic!("expected a report");
        };
        assert!(matches!(
            report.outcome,
            ChildOutcome::SyntaxInvalid { line: Some(3), column: None, .. }
        ));
        assert!(report.locals.is_none());
    }
}
