//! Length-framed binary messages shared by all four sockets.
//!
//! A frame on the wire is a `u32` body length followed by the body:
//!
//! ```text
//! version      u16
//! tag          u16
//! name         u16 label count, then per label u16 length + bytes
//! payload_len  u32
//! payload      payload_len bytes
//! ```
//!
//! All integers are little-endian. Payload encodings are per-tag; strings
//! are `u32` length + UTF-8 bytes, timestamps are seconds + picosecond
//! fraction.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::name::Name;

/// Current wire version. Mismatches earn a fail reply, never a disconnect.
pub const WIRE_VERSION: u16 = 1;

/// Upper bound on a frame body; anything larger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 1 << 20;

pub const PICOS_PER_SEC: u64 = 1_000_000_000_000;

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Wall-clock instant: seconds since the epoch plus a picosecond fraction.
///
/// The console clock is assumed non-decreasing in steady state; nothing
/// here enforces monotonicity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub secs: u64,
    pub picos: u64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, picos: 0 };

    /// Normalizing constructor; picosecond overflow carries into seconds.
    pub fn new(secs: u64, picos: u64) -> Timestamp {
        Timestamp {
            secs: secs + picos / PICOS_PER_SEC,
            picos: picos % PICOS_PER_SEC,
        }
    }

    pub fn now() -> Timestamp {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            secs: elapsed.as_secs(),
            picos: u64::from(elapsed.subsec_nanos()) * 1_000,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:012}", self.secs, self.picos)
    }
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Message tag. Unknown values survive decoding so the receiver can reply
/// with a failure instead of dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Success,
    Fail,
    Data,
    Info,
    Create,
    Destroy,
    Wait,
    ConsoleAdd,
    ConsoleAttach,
    ConsoleDetach,
    ConsoleHistory,
    StatAdd,
    StatRemove,
    LogEntry,
    Unknown(u16),
}

impl Tag {
    pub fn to_u16(self) -> u16 {
        match self {
            Tag::Success => 0x0000,
            Tag::Fail => 0x0001,
            Tag::Data => 0x0002,
            Tag::Info => 0x0010,
            Tag::Create => 0x0011,
            Tag::Destroy => 0x0012,
            Tag::Wait => 0x0013,
            Tag::ConsoleAdd => 0x0020,
            Tag::ConsoleAttach => 0x0021,
            Tag::ConsoleDetach => 0x0022,
            Tag::ConsoleHistory => 0x0023,
            Tag::StatAdd => 0x0030,
            Tag::StatRemove => 0x0031,
            Tag::LogEntry => 0x0040,
            Tag::Unknown(raw) => raw,
        }
    }

    pub fn from_u16(raw: u16) -> Tag {
        match raw {
            0x0000 => Tag::Success,
            0x0001 => Tag::Fail,
            0x0002 => Tag::Data,
            0x0010 => Tag::Info,
            0x0011 => Tag::Create,
            0x0012 => Tag::Destroy,
            0x0013 => Tag::Wait,
            0x0020 => Tag::ConsoleAdd,
            0x0021 => Tag::ConsoleAttach,
            0x0022 => Tag::ConsoleDetach,
            0x0023 => Tag::ConsoleHistory,
            0x0030 => Tag::StatAdd,
            0x0031 => Tag::StatRemove,
            0x0040 => Tag::LogEntry,
            other => Tag::Unknown(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub tag: Tag,
    pub name: Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: Tag, name: Name, payload: Vec<u8>) -> Frame {
        Frame {
            header: Header {
                version: WIRE_VERSION,
                tag,
                name,
            },
            payload,
        }
    }

    pub fn success(name: Name, message: &str) -> Frame {
        Frame::new(Tag::Success, name, encode_string(message))
    }

    pub fn fail(name: Name, diagnostic: &str) -> Frame {
        Frame::new(Tag::Fail, name, encode_string(diagnostic))
    }

    pub fn data_line(name: Name, ts: Timestamp, line: &str) -> Frame {
        let mut payload = Vec::with_capacity(20 + line.len());
        put_timestamp(&mut payload, ts);
        put_string(&mut payload, line);
        Frame::new(Tag::Data, name, payload)
    }

    pub fn info(name: Name) -> Frame {
        Frame::new(Tag::Info, name, Vec::new())
    }

    pub fn create(name: Name, request: &CreateRequest) -> Frame {
        Frame::new(Tag::Create, name, request.encode())
    }

    pub fn destroy(name: Name) -> Frame {
        Frame::new(Tag::Destroy, name, Vec::new())
    }

    pub fn wait(name: Name) -> Frame {
        Frame::new(Tag::Wait, name, Vec::new())
    }

    pub fn console_add(name: Name) -> Frame {
        Frame::new(Tag::ConsoleAdd, name, Vec::new())
    }

    pub fn console_attach(name: Name) -> Frame {
        Frame::new(Tag::ConsoleAttach, name, Vec::new())
    }

    pub fn console_detach(name: Name) -> Frame {
        Frame::new(Tag::ConsoleDetach, name, Vec::new())
    }

    pub fn console_history(name: Name, since: Timestamp) -> Frame {
        let mut payload = Vec::with_capacity(16);
        put_timestamp(&mut payload, since);
        Frame::new(Tag::ConsoleHistory, name, payload)
    }

    pub fn stat_add(name: Name, pid: u32, taps: &[String]) -> Frame {
        let mut payload = Vec::new();
        put_u32(&mut payload, pid);
        put_u16(&mut payload, taps.len() as u16);
        for tap in taps {
            put_string(&mut payload, tap);
        }
        Frame::new(Tag::StatAdd, name, payload)
    }

    pub fn stat_remove(name: Name) -> Frame {
        Frame::new(Tag::StatRemove, name, Vec::new())
    }

    pub fn log_entry(name: Name, ts: Timestamp, line: &str) -> Frame {
        let mut payload = Vec::with_capacity(20 + line.len());
        put_timestamp(&mut payload, ts);
        put_string(&mut payload, line);
        Frame::new(Tag::LogEntry, name, payload)
    }

    pub fn is_success(&self) -> bool {
        self.header.tag == Tag::Success
    }

    pub fn is_fail(&self) -> bool {
        self.header.tag == Tag::Fail
    }

    /// Success, fail, or data: anything a command may be answered with.
    pub fn is_reply(&self) -> bool {
        matches!(self.header.tag, Tag::Success | Tag::Fail | Tag::Data)
    }

    /// Encode the frame, outer length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16 + self.payload.len());
        put_u16(&mut body, self.header.version);
        put_u16(&mut body, self.header.tag.to_u16());
        put_name(&mut body, &self.header.name);
        put_u32(&mut body, self.payload.len() as u32);
        body.extend_from_slice(&self.payload);

        let mut out = Vec::with_capacity(4 + body.len());
        put_u32(&mut out, body.len() as u32);
        out.extend_from_slice(&body);
        out
    }

    /// Decode a frame body (everything after the outer length prefix).
    pub fn decode(body: &[u8]) -> Result<Frame> {
        let mut reader = Reader::new(body);
        let version = reader.take_u16()?;
        let tag = Tag::from_u16(reader.take_u16()?);
        let name = reader.take_name()?;
        let payload_len = reader.take_u32()? as usize;
        let payload = reader.take_bytes(payload_len)?.to_vec();
        if !reader.is_empty() {
            return Err(Error::Decode("trailing bytes after payload".into()));
        }
        Ok(Frame {
            header: Header { version, tag, name },
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Client request to create a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub memory_mb: u32,
    pub cpus: u16,
    /// Number of tap devices to allocate from the pool.
    pub taps: u16,
    /// Unikernel image path, passed through to the hypervisor.
    pub image: String,
    /// Extra arguments appended to the hypervisor command line.
    pub args: Vec<String>,
}

impl CreateRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        put_u32(&mut payload, self.memory_mb);
        put_u16(&mut payload, self.cpus);
        put_u16(&mut payload, self.taps);
        put_string(&mut payload, &self.image);
        put_u16(&mut payload, self.args.len() as u16);
        for arg in &self.args {
            put_string(&mut payload, arg);
        }
        payload
    }

    pub fn decode(payload: &[u8]) -> Result<CreateRequest> {
        let mut reader = Reader::new(payload);
        let memory_mb = reader.take_u32()?;
        let cpus = reader.take_u16()?;
        let taps = reader.take_u16()?;
        let image = reader.take_string()?;
        let count = reader.take_u16()?;
        let mut args = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            args.push(reader.take_string()?);
        }
        Ok(CreateRequest {
            memory_mb,
            cpus,
            taps,
            image,
            args,
        })
    }
}

/// Per-VM record summary, serialized as JSON in info and create replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub pid: u32,
    pub memory_mb: u32,
    pub cpus: u16,
    pub taps: Vec<String>,
    pub fifo: String,
}

/// Decode a `Success`/`Fail` message payload.
pub fn decode_string(payload: &[u8]) -> Result<String> {
    let mut reader = Reader::new(payload);
    let s = reader.take_string()?;
    Ok(s)
}

/// Decode a `Data` or `LogEntry` payload: timestamp plus line.
pub fn decode_data_line(payload: &[u8]) -> Result<(Timestamp, String)> {
    let mut reader = Reader::new(payload);
    let ts = reader.take_timestamp()?;
    let line = reader.take_string()?;
    Ok((ts, line))
}

/// Decode a `ConsoleHistory` payload: the since-cursor.
pub fn decode_history_since(payload: &[u8]) -> Result<Timestamp> {
    let mut reader = Reader::new(payload);
    reader.take_timestamp()
}

/// Decode a `StatAdd` payload: pid plus tap names.
pub fn decode_stat_add(payload: &[u8]) -> Result<(u32, Vec<String>)> {
    let mut reader = Reader::new(payload);
    let pid = reader.take_u32()?;
    let count = reader.take_u16()?;
    let mut taps = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        taps.push(reader.take_string()?);
    }
    Ok((pid, taps))
}

// ---------------------------------------------------------------------------
// Stream I/O
// ---------------------------------------------------------------------------

/// Read one frame. `Ok(None)` means the peer closed cleanly at a frame
/// boundary. A `Decode` error leaves the stream positioned at the next
/// frame, so the caller may reply with a failure and keep reading;
/// `Protocol` and `Io` errors are not recoverable.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Protocol(format!("truncated frame: {e}")))?;
    Frame::decode(&body).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Primitive encoding
// ---------------------------------------------------------------------------

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_string(s: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + s.len());
    put_string(&mut buf, s);
    buf
}

fn put_timestamp(buf: &mut Vec<u8>, ts: Timestamp) {
    put_u64(buf, ts.secs);
    put_u64(buf, ts.picos);
}

fn put_name(buf: &mut Vec<u8>, name: &Name) {
    put_u16(buf, name.labels().len() as u16);
    for label in name.labels() {
        put_u16(buf, label.len() as u16);
        buf.extend_from_slice(label.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Decode(format!(
                "need {n} bytes, have {}",
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_u16(&mut self) -> Result<u16> {
        let bytes = self.take_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes = self.take_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_u64(&mut self) -> Result<u64> {
        let bytes = self.take_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn take_string(&mut self) -> Result<String> {
        let len = self.take_u32()? as usize;
        let bytes = self.take_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Decode(format!("bad utf-8: {e}")))
    }

    fn take_timestamp(&mut self) -> Result<Timestamp> {
        let secs = self.take_u64()?;
        let picos = self.take_u64()?;
        if picos >= PICOS_PER_SEC {
            return Err(Error::Decode(format!("picosecond field {picos} out of range")));
        }
        Ok(Timestamp { secs, picos })
    }

    fn take_name(&mut self) -> Result<Name> {
        let count = self.take_u16()?;
        let mut labels = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let len = usize::from(self.take_u16()?);
            let bytes = self.take_bytes(len)?;
            let label = String::from_utf8(bytes.to_vec())
                .map_err(|e| Error::Decode(format!("bad utf-8 in label: {e}")))?;
            labels.push(label);
        }
        Name::from_labels(labels)
    }
}
