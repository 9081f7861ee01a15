//! RESP2 client codec
//!
//! Commands go out as arrays of bulk strings; replies are parsed from a
//! buffered async reader with a frame size cap.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Largest reply accepted from a node
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// RESP reply value
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// +OK\r\n
    SimpleString(Bytes),
    /// -ERR message\r\n
    Error(Bytes),
    /// :123\r\n
    Integer(i64),
    /// $5\r\nhello\r\n
    BulkString(Bytes),
    /// *2\r\n...
    Array(Vec<RespValue>),
    /// $-1\r\n or *-1\r\n
    Null,
}

impl RespValue {
    /// Text of a string-like reply
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(b) | RespValue::BulkString(b) => {
                Some(String::from_utf8_lossy(b).into_owned())
            }
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Unexpected end of input")]
    UnexpectedEof,
    #[error("Frame too large: {0} bytes (max: {1} bytes)")]
    FrameTooLarge(usize, usize),
    #[error("Invalid RESP type: {0}")]
    InvalidType(u8),
}

/// Encode a command as an array of bulk strings
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf.freeze()
}

/// Async reply parser
pub struct RespReader<R: AsyncRead + Unpin> {
    reader: BufReader<R>,
    max_bytes: usize,
    bytes_read: usize,
}

impl<R: AsyncRead + Unpin> RespReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_bytes(reader, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_bytes(reader: R, max_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_bytes,
            bytes_read: 0,
        }
    }

    fn check_frame_size(&mut self, additional: usize) -> Result<(), RespError> {
        self.bytes_read = self.bytes_read.saturating_add(additional);
        if self.bytes_read > self.max_bytes {
            Err(RespError::FrameTooLarge(self.bytes_read, self.max_bytes))
        } else {
            Ok(())
        }
    }

    /// Read one complete reply
    pub async fn read_reply(&mut self) -> Result<RespValue, RespError> {
        self.bytes_read = 0;
        self.parse().await
    }

    async fn parse(&mut self) -> Result<RespValue, RespError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(RespError::UnexpectedEof);
        }
        self.check_frame_size(n)?;

        let line = line.trim_end_matches(['\r', '\n']);
        let Some(&kind) = line.as_bytes().first() else {
            return Err(RespError::InvalidFormat("Empty line".to_string()));
        };
        let body = &line[1..];
        match kind {
            b'+' => Ok(RespValue::SimpleString(Bytes::from(body.to_string()))),
            b'-' => Ok(RespValue::Error(Bytes::from(body.to_string()))),
            b':' => body
                .parse::<i64>()
                .map(RespValue::Integer)
                .map_err(|_| RespError::InvalidFormat(format!("Invalid integer: {}", body))),
            b'$' => self.parse_bulk(body).await,
            b'*' => self.parse_array(body).await,
            other => Err(RespError::InvalidType(other)),
        }
    }

    async fn parse_bulk(&mut self, len: &str) -> Result<RespValue, RespError> {
        let len = len
            .parse::<i64>()
            .map_err(|_| RespError::InvalidFormat(format!("Invalid bulk string length: {}", len)))?;
        if len == -1 {
            return Ok(RespValue::Null);
        }
        if len < 0 {
            return Err(RespError::InvalidFormat(format!("Invalid bulk string length: {}", len)));
        }
        let len = len as usize;
        self.check_frame_size(len + 2)?;

        let mut buffer = vec![0u8; len + 2];
        self.reader.read_exact(&mut buffer).await?;
        if !buffer.ends_with(b"\r\n") {
            return Err(RespError::InvalidFormat(
                "Expected \\r\\n after bulk string".to_string(),
            ));
        }
        buffer.truncate(len);
        Ok(RespValue::BulkString(Bytes::from(buffer)))
    }

    async fn parse_array(&mut self, count: &str) -> Result<RespValue, RespError> {
        let count = count
            .parse::<i64>()
            .map_err(|_| RespError::InvalidFormat(format!("Invalid array length: {}", count)))?;
        if count == -1 {
            return Ok(RespValue::Null);
        }
        if count < 0 {
            return Err(RespError::InvalidFormat(format!("Invalid array length: {}", count)));
        }
        let mut items = Vec::with_capacity((count as usize).min(1024));
        for _ in 0..count {
            items.push(Box::pin(self.parse()).await?);
        }
        Ok(RespValue::Array(items))
    }
}
