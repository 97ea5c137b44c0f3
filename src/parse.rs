use crate::Frame;

use bytes::Bytes;
use std::{fmt, str, vec};

/// Utility for picking apart an array reply.
///
/// Push messages of the subscription protocol are represented as array
/// frames. Each entry in the frame is a "token". A `Parse` is initialized
/// with the array frame and provides a cursor-like API to extract the
/// entries one by one.
#[derive(Debug)]
pub(crate) struct Parse {
    /// Array frame iterator
    parts: vec::IntoIter<Frame>,
}

/// Error encountered while parsing a frame
#[derive(Debug)]
pub(crate) enum ParseError {
    /// Attempting to extract a value failed due to the frame being fully consumed
    EndOfStream,

    /// All other errors
    Other(String),
}

impl Parse {
    /// Create a new `Parse` to parse the contents of `frame`,
    ///
    /// Returns `Err` if `frame` is not an array Frame
    pub(crate) fn new(frame: Frame) -> Result<Parse, ParseError> {
        let array = match frame {
            Frame::Array(arr) => arr,
            other => return Err(format!("expected array, got {:?}", other).into()),
        };

        Ok(Parse {
            parts: array.into_iter(),
        })
    }

    /// Number of entries not consumed yet.
    pub(crate) fn remaining(&self) -> usize {
        self.parts.len()
    }

    /// Return the next entry. Array frame are array of frames, so the next
    /// entry is a frame
    pub(crate) fn next(&mut self) -> Result<Frame, ParseError> {
        self.parts.next().ok_or(ParseError::EndOfStream)
    }

    /// Return the entry as a string
    ///
    /// If the next entry cannot be represented as a String, then an error is returned.
    pub(crate) fn next_string(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(data) => str::from_utf8(&data[..])
                .map(|s| s.to_string())
                .map_err(|_| "invalid string".into()),
            other => Err(format!("expected simple frame or bulk frame, got {:?}", other).into()),
        }
    }

    /// Like `next_string`, but a nil entry gives `None`.
    ///
    /// `UNSUBSCRIBE` with nothing subscribed confirms with a nil channel.
    pub(crate) fn next_optional_string(&mut self) -> Result<Option<String>, ParseError> {
        match self.parts.as_slice().first() {
            Some(Frame::Null) => {
                self.next()?;
                Ok(None)
            }
            _ => self.next_string().map(Some),
        }
    }

    /// Return the next entry as raw bytes.
    ///
    /// If the next entry cannot be represented as raw bytes, an error is returned
    pub(crate) fn next_bytes(&mut self) -> Result<Bytes, ParseError> {
        match self.next()? {
            Frame::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            Frame::Bulk(data) => Ok(data),
            other => Err(format!("expected simple frame or bulk frame, got {:?}", other).into()),
        }
    }

    /// Return the next entry as an integer.
    ///
    /// This include `Simple`, `Bulk` and `Integer` frame types.
    /// `Simple` and `Bulk` frame types are parsed.
    ///
    /// if the next entry cannot be represented as an integer, then an error is returned
    pub(crate) fn next_int(&mut self) -> Result<i64, ParseError> {
        use atoi::atoi;

        match self.next()? {
            Frame::Simple(s) => atoi::<i64>(s.as_bytes()).ok_or_else(|| "invalid number".into()),
            Frame::Bulk(data) => atoi::<i64>(&data).ok_or_else(|| "invalid number".into()),
            Frame::Integer(num) => Ok(num),
            other => Err(format!("expected int frame but got {:?}", other).into()),
        }
    }

    /// Ensure there are no more entries in the array
    pub(crate) fn finish(&mut self) -> Result<(), ParseError> {
        if self.parts.next().is_none() {
            Ok(())
        } else {
            Err("expected end of frame, but there was more".into())
        }
    }
}

impl From<String> for ParseError {
    fn from(src: String) -> ParseError {
        ParseError::Other(src)
    }
}

impl From<&str> for ParseError {
    fn from(src: &str) -> ParseError {
        ParseError::Other(src.to_string())
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EndOfStream => "unexpected end of frame".fmt(f),
            ParseError::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for ParseError {}
