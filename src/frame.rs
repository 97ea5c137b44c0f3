//! Provides a type representing a Redis protocol reply frame as well as
//! utilities for decoding frames from a byte array.
//!
//! Decoding is split in two passes, the same way the connection uses it:
//! [`Frame::check`] walks the buffer without allocating and reports
//! [`Error::Incomplete`] when more bytes must be read from the socket, then
//! [`Frame::parse`] builds the value once a whole frame is known to be there.

use bytes::{Buf, Bytes};
use std::convert::TryInto;
use std::fmt;
use std::io::Cursor;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;

/// A reply frame in the Redis protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// `+OK`, `+QUEUED`, `+PONG` ...
    Simple(String),
    /// `-ERR ...`, text kept verbatim.
    Error(String),
    /// `:42`
    Integer(i64),
    /// `$5\r\nhello`
    Bulk(Bytes),
    /// `$-1`, the null bulk string.
    Null,
    /// `*N` followed by N nested frames.
    Array(Vec<Frame>),
    /// `*-1`, returned by EXEC when a transaction was aborted.
    NullArray,
}

#[derive(Debug)]
pub enum Error {
    /// Not enough data is available to parse a message
    Incomplete,

    /// Invalid message encoding
    Other(String),
}

impl Frame {
    /// Checks if an entire message can be decoded from `src`.
    ///
    /// On success the cursor is left just past the end of the frame, so its
    /// position is the frame's encoded length.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        match get_u8(src)? {
            b'+' | b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                get_integer(src)?;
                Ok(())
            }
            b'$' => {
                if let Some(len) = get_length(src)? {
                    skip(src, len)?;
                    expect_crlf(src)?;
                }
                Ok(())
            }
            b'*' => {
                if let Some(len) = get_length(src)? {
                    for _ in 0..len {
                        Frame::check(src)?;
                    }
                }
                Ok(())
            }
            actual => Err(format!("invalid frame type byte `{}`", actual).into()),
        }
    }

    /// The message has already been validated with `check`.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match get_u8(src)? {
            b'+' => {
                let line = get_line(src)?.to_vec();
                Ok(Frame::Simple(String::from_utf8(line)?))
            }
            b'-' => {
                let line = get_line(src)?.to_vec();
                Ok(Frame::Error(String::from_utf8(line)?))
            }
            b':' => Ok(Frame::Integer(get_integer(src)?)),
            b'$' => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(len) => {
                    if src.remaining() < len + 2 {
                        return Err(Error::Incomplete);
                    }
                    let data = Bytes::copy_from_slice(&src.chunk()[..len]);
                    skip(src, len)?;
                    expect_crlf(src)?;
                    Ok(Frame::Bulk(data))
                }
            },
            b'*' => match get_length(src)? {
                None => Ok(Frame::NullArray),
                Some(len) => {
                    // 长度由对端给出，不能直接信任它来预分配
                    let mut out = Vec::with_capacity(len.min(64));
                    for _ in 0..len {
                        out.push(Frame::parse(src)?);
                    }
                    Ok(Frame::Array(out))
                }
            },
            actual => Err(format!("invalid frame type byte `{}`", actual).into()),
        }
    }

    /// Turns an error reply into `Err(Error::Server)`, passes anything else
    /// through.
    pub fn into_result(self) -> crate::Result<Frame> {
        match self {
            Frame::Error(msg) => Err(crate::Error::Server(msg)),
            frame => Ok(frame),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::NullArray)
    }

    /// Returns true for a status reply whose text equals `expected`.
    pub fn is_status(&self, expected: &str) -> bool {
        matches!(self, Frame::Simple(s) if s == expected)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Payload of a bulk or status reply. `None` for every other variant.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Frame::Bulk(data) => Some(data),
            Frame::Simple(s) => Some(Bytes::from(s.into_bytes())),
            _ => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use std::str;

        match self {
            Frame::Simple(response) => response.fmt(fmt),
            Frame::Error(msg) => write!(fmt, "(error) {}", msg),
            Frame::Integer(num) => write!(fmt, "(integer) {}", num),
            Frame::Bulk(msg) => match str::from_utf8(msg) {
                Ok(string) => write!(fmt, "\"{}\"", string),
                Err(_) => write!(fmt, "{:?}", msg),
            },
            Frame::Null | Frame::NullArray => "(nil)".fmt(fmt),
            Frame::Array(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        writeln!(fmt)?;
                    }
                    write!(fmt, "{}) {}", i + 1, part)?;
                }
                Ok(())
            }
        }
    }
}

/// 取Cursor当前指向的第一个字节，Cursor向后移动一个字节
fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.get_u8())
}

/// 使Cursor向后移动n个字节
fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    src.advance(n);
    Ok(())
}

fn expect_crlf(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
    if src.remaining() < 2 {
        return Err(Error::Incomplete);
    }
    if &src.chunk()[..2] != b"\r\n" {
        return Err("bulk payload is not terminated by CRLF".into());
    }
    src.advance(2);
    Ok(())
}

/// 将一行转换为i64，整行必须都是数字
fn get_integer(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    use atoi::FromRadix10SignedChecked;

    let line = get_line(src)?;
    match i64::from_radix_10_signed_checked(line) {
        (Some(value), used) if used == line.len() && line.iter().any(u8::is_ascii_digit) => {
            Ok(value)
        }
        _ => Err(format!("invalid integer {:?}", String::from_utf8_lossy(line)).into()),
    }
}

/// Reads a bulk/array length prefix. `-1` is the null sentinel, any other
/// negative value is rejected.
fn get_length(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, Error> {
    let len = get_integer(src)?;
    match len {
        -1 => Ok(None),
        len if len < 0 => Err(format!("invalid length prefix {}", len).into()),
        len => Ok(Some(len.try_into()?)),
    }
}

/// 获取一行(\r\n)
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    // get_ref()获得当前Cursor的底层数据结构的引用
    let buf: &'a [u8] = *src.get_ref();
    if buf.len() < start + 2 {
        return Err(Error::Incomplete);
    }
    let end = buf.len() - 1;
    for i in start..end {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);
            return Ok(&buf[start..i]);
        }
    }

    Err(Error::Incomplete)
}

impl From<String> for Error {
    fn from(value: String) -> Error {
        Error::Other(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Error {
        Error::Other(value.to_string())
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_value: FromUtf8Error) -> Error {
        "invalid frame format; line is not utf-8".into()
    }
}

impl From<TryFromIntError> for Error {
    fn from(_value: TryFromIntError) -> Error {
        "invalid frame format; length out of range".into()
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Incomplete => "stream ended early".fmt(f),
            Error::Other(err) => err.fmt(f),
        }
    }
}
