use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DecodeError, FrameError};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Tags accepted on inbound frames. `msg` is the legacy spelling of `message`.
const CLIENT_TAGS: &[&str] = &["register", "message", "msg", "file", "list"];

pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        name: String,
    },
    #[serde(alias = "msg")]
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default)]
        text: String,
    },
    /// Header for a file body; exactly `size` raw bytes follow the line.
    File {
        #[serde(default)]
        to: String,
        filename: String,
        size: u64,
    },
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ok { text: String },
    Error { text: String },
    Message { from: String, text: String },
    Users { names: Vec<String> },
    /// Header for a relayed file; the body follows on the wire, outside the record.
    File {
        from: String,
        filename: String,
        size: u64,
    },
}

impl ServerFrame {
    pub fn ok(text: impl Into<String>) -> Self {
        ServerFrame::Ok { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        ServerFrame::Error { text: text.into() }
    }
}

/// Outcome of reading one control line: `Err` means the line arrived but
/// did not decode, which leaves the stream usable.
pub type Decoded = Result<ClientFrame, DecodeError>;

/// Reads the next non-blank control line and decodes it.
///
/// Returns `Ok(None)` on a clean end of stream. The reader is left positioned
/// directly after the line's newline, so a `file` header's body can be read
/// next without any buffered bytes being lost.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Decoded>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader, max_len).await? {
        Some(line) => Ok(Some(decode_frame(&line))),
        None => Ok(None),
    }
}

async fn read_line<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    // Payload plus an optional "\r\n" terminator.
    let limit = (max_len as u64).saturating_add(2);
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes as u64 == limit && line.last() != Some(&b'\n') {
            return Err(FrameError::TooLong { limit: max_len });
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(Some(line));
    }
}

/// Classifies a control line as a frame or as the reason it was rejected.
pub fn decode_frame(line: &[u8]) -> Decoded {
    let value: Value = serde_json::from_slice(line).map_err(DecodeError::InvalidJson)?;
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) if CLIENT_TAGS.contains(&kind) => kind.to_string(),
        _ => return Err(DecodeError::UnknownType),
    };
    serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
}

/// Serializes one frame as a newline-terminated JSON line.
pub fn encode_frame<T: Serialize>(message: &T) -> io::Result<Vec<u8>> {
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    Ok(encoded)
}

/// Line reader for peers of the hub. Decode failures surface as
/// `InvalidData` since a client has no way to recover from them.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode_frame(message)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
