//! Record store wire protocol.
//!
//! Request frame: `[OpCode (1b)][Length u32 LE (4b)][Payload]`.
//! Reply: `[Status (1b)]`, followed by `[Length u32 LE][Bytes]` for
//! `STATUS_VALUE` and `STATUS_ERROR`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// --- OpCodes ---
pub const OP_SET: u8 = 0x01;
pub const OP_GET: u8 = 0x02;
pub const OP_PING: u8 = 0x03;
pub const OP_COMPACT: u8 = 0x08;
pub const OP_AUTH: u8 = 0x09;

// --- Status codes ---
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_VALUE: u8 = 0x01;
pub const STATUS_NOT_FOUND: u8 = 0x02;
pub const STATUS_ERROR: u8 = 0x03;

/// Largest payload either side will accept.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub op: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Value(Vec<u8>),
    NotFound,
    Error(String),
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Reads one request frame. `Ok(None)` on a clean close between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut op_buf = [0u8; 1];
    match reader.read_exact(&mut op_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let payload = read_sized(reader).await?;
    Ok(Some(Frame { op: op_buf[0], payload }))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, op: u8, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME {
        return Err(invalid(format!("payload of {} bytes exceeds {}", payload.len(), MAX_FRAME)));
    }
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(op);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

pub async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> io::Result<()> {
    let mut buf = Vec::new();
    match reply {
        Reply::Ok => buf.push(STATUS_OK),
        Reply::NotFound => buf.push(STATUS_NOT_FOUND),
        Reply::Value(bytes) => {
            buf.push(STATUS_VALUE);
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        Reply::Error(msg) => {
            buf.push(STATUS_ERROR);
            buf.extend_from_slice(&(msg.len() as u32).to_le_bytes());
            buf.extend_from_slice(msg.as_bytes());
        }
    }
    writer.write_all(&buf).await?;
    writer.flush().await
}

pub async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Reply> {
    let mut status = [0u8; 1];
    reader.read_exact(&mut status).await?;
    match status[0] {
        STATUS_OK => Ok(Reply::Ok),
        STATUS_NOT_FOUND => Ok(Reply::NotFound),
        STATUS_VALUE => Ok(Reply::Value(read_sized(reader).await?)),
        STATUS_ERROR => {
            let bytes = read_sized(reader).await?;
            Ok(Reply::Error(String::from_utf8_lossy(&bytes).into_owned()))
        }
        other => Err(invalid(format!("unknown status 0x{:02X}", other))),
    }
}

async fn read_sized<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(invalid(format!("frame of {} bytes exceeds {}", len, MAX_FRAME)));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

// --- Payload layouts ---

/// SET payload: `[Count u16][Key Len u16][Key][Value Len u32][Value]...`
pub fn encode_batch(pairs: &[(String, Vec<u8>)]) -> io::Result<Vec<u8>> {
    if pairs.len() > u16::MAX as usize {
        return Err(invalid("too many pairs in one batch"));
    }
    let mut buf = Vec::new();
    buf.extend_from_slice(&(pairs.len() as u16).to_le_bytes());
    for (key, value) in pairs {
        put_short_str(&mut buf, key)?;
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
    }
    Ok(buf)
}

pub fn decode_batch(payload: &[u8]) -> io::Result<Vec<(String, Vec<u8>)>> {
    let mut cursor = Cursor { buf: payload, pos: 0 };
    let count = u16::from_le_bytes(cursor.take_array()?) as usize;
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let key = cursor.take_short_str()?;
        let len = u32::from_le_bytes(cursor.take_array()?) as usize;
        let value = cursor.take(len)?.to_vec();
        pairs.push((key, value));
    }
    if cursor.pos != payload.len() {
        return Err(invalid("trailing bytes after batch"));
    }
    Ok(pairs)
}

/// AUTH payload: `[User Len u16][User][Pass Len u16][Pass]`
pub fn encode_auth(user: &str, pass: &str) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    put_short_str(&mut buf, user)?;
    put_short_str(&mut buf, pass)?;
    Ok(buf)
}

pub fn decode_auth(payload: &[u8]) -> io::Result<(String, String)> {
    let mut cursor = Cursor { buf: payload, pos: 0 };
    let user = cursor.take_short_str()?;
    let pass = cursor.take_short_str()?;
    Ok((user, pass))
}

fn put_short_str(buf: &mut Vec<u8>, s: &str) -> io::Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(invalid("string longer than 65535 bytes"));
    }
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(invalid("payload truncated")),
        }
    }

    fn take_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn take_short_str(&mut self) -> io::Result<String> {
        let len = u16::from_le_bytes(self.take_array()?) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| invalid("key is not utf-8"))
    }
}
