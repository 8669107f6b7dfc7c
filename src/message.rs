use anyhow::ensure;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::FtlError;

/// One frame on the gate channel: a short ASCII tag plus an arbitrary JSON body.
pub type GateMessage = (String, Value);

/// Frames are `HHHHHHHH` (lowercase hex byte length) followed by exactly that
/// many bytes of UTF-8 JSON holding the `[tag, body]` pair. Eight hex digits
/// bound a frame at 16^8 - 1 bytes.
const MAX_FRAME_LEN: usize = 1 << 32;

fn encode(msg_type: &str, msg_data: &Value) -> anyhow::Result<Vec<u8>> {
    let body = serde_json::to_vec(&serde_json::json!([msg_type, msg_data]))?;
    ensure!(
        body.len() < MAX_FRAME_LEN,
        "message {} is too big, break messages up into less than 16^8 bytes",
        msg_type
    );
    let mut frame = format!("{:08x}", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Send one frame, propagating any I/O error to the caller.
pub async fn send_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_type: &str,
    msg_data: &Value,
) -> anyhow::Result<()> {
    let frame = encode(msg_type, msg_data)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Send one frame to a sink that may already be gone. A broken pipe means the
/// gate died; the read side will surface that, so here it is only logged.
pub async fn send_message_best_effort<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_type: &str,
    msg_data: &Value,
) -> anyhow::Result<()> {
    match send_message(writer, msg_type, msg_data).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let broken_pipe = e
                .chain()
                .filter_map(|c| c.downcast_ref::<std::io::Error>())
                .any(|io| io.kind() == std::io::ErrorKind::BrokenPipe);
            if broken_pipe {
                tracing::error!(msg_type, "broken pipe writing to gate");
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

/// Read the next frame. Returns `Ok(None)` on a clean end-of-stream.
///
/// The reader may hand back arbitrarily small chunks, may interleave bare
/// whitespace between frames (an interactive gate session does), and may use
/// zero-length frames as keep-alives; all of that is absorbed here. A length
/// prefix that is not hex fails with the prefix and whatever trailing bytes
/// were still readable, for diagnostics.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> anyhow::Result<Option<GateMessage>> {
    loop {
        let mut prefix = [0u8; 8];
        let mut have = 0;
        while have < 8 {
            let n = reader.read(&mut prefix[have..]).await?;
            if n == 0 {
                if have == 0 {
                    return Ok(None);
                }
                return Err(FtlError::Protocol {
                    prefix: prefix[..have].to_vec(),
                    trailing: Vec::new(),
                }
                .into());
            }
            have += n;
        }

        let text = std::str::from_utf8(&prefix).unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }
        let length = match usize::from_str_radix(text, 16) {
            Ok(l) => l,
            Err(_) => {
                let mut trailing = vec![0u8; 4096];
                let n = reader.read(&mut trailing).await.unwrap_or(0);
                trailing.truncate(n);
                return Err(FtlError::Protocol {
                    prefix: prefix.to_vec(),
                    trailing,
                }
                .into());
            }
        };
        if length == 0 {
            continue;
        }

        loop {
            let mut value = vec![0u8; length];
            let mut have = 0;
            while have < length {
                let n = reader.read(&mut value[have..]).await?;
                if n == 0 {
                    return Ok(None);
                }
                have += n;
            }
            let payload = trim_ascii(&value);
            if payload.is_empty() {
                // Only padding arrived; keep reading until a real payload shows up.
                continue;
            }
            let message: GateMessage =
                serde_json::from_slice(payload).map_err(FtlError::Payload)?;
            return Ok(Some(message));
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = duplex(1024);
        send_message(&mut client, "Hello", &json!({})).await.unwrap();
        let (tag, body) = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(tag, "Hello");
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn round_trip_preserves_arbitrary_bodies() {
        let (mut client, mut server) = duplex(4096);
        let body = json!({"module_name": "argtest", "module_args": {"somekey": "somevalue"}, "n": [1, 2.5, null, true]});
        send_message(&mut client, "Module", &body).await.unwrap();
        let (tag, got) = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(tag, "Module");
        assert_eq!(got, body);
    }

    #[tokio::test]
    async fn decodes_literal_hello_frame() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(b"0000000d").await.unwrap();
        client.write_all(br#"["Hello", {}]"#).await.unwrap();
        let (tag, body) = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(tag, "Hello");
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn skips_zero_length_frames() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(b"00000000").await.unwrap();
        client.write_all(b"0000000d").await.unwrap();
        client.write_all(br#"["Hello", {}]"#).await.unwrap();
        let (tag, _) = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(tag, "Hello");
    }

    #[tokio::test]
    async fn invalid_length_prefix_reports_prefix_and_trailing() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(b"invalid!").await.unwrap();
        client.write_all(b"more").await.unwrap();
        drop(client);
        let err = read_message(&mut server).await.unwrap_err();
        match err.downcast_ref::<FtlError>() {
            Some(FtlError::Protocol { prefix, trailing }) => {
                assert_eq!(prefix, b"invalid!");
                assert_eq!(trailing, b"more");
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tolerates_chunked_reads() {
        let (mut client, mut server) = duplex(1024);
        let reader = tokio::spawn(async move { read_message(&mut server).await });
        // Dribble the frame a few bytes at a time.
        for chunk in [&b"0000"[..], b"000d", br#"["He"#, br#"llo", "#, b"{}]"] {
            client.write_all(chunk).await.unwrap();
            client.flush().await.unwrap();
            tokio::task::yield_now().await;
        }
        let (tag, body) = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(tag, "Hello");
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn tolerates_whitespace_between_frames() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(b"        ").await.unwrap();
        client.write_all(b"0000000d").await.unwrap();
        client.write_all(br#"["Hello", {}]"#).await.unwrap();
        let (tag, _) = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(tag, "Hello");
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (client, mut server) = duplex(64);
        drop(client);
        assert!(read_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn best_effort_send_swallows_broken_pipe() {
        let (mut client, server) = duplex(64);
        drop(server);
        send_message_best_effort(&mut client, "Shutdown", &json!({}))
            .await
            .unwrap();
    }
}
