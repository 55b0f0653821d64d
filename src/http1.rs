//! Minimal HTTP/1.1 head parsing and body framing for the raw connections the
//! proxy owns itself: the client's request head before dispatch, and the
//! upstream response read off an overlay connection.

use crate::lookahead::Lookahead;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Upper bound for an upstream response head.
pub const MAX_RESPONSE_HEAD: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;

/// Longest chunk-size or trailer line accepted in a chunked body.
const MAX_CHUNK_LINE: u64 = 4 * 1024;

const MAX_TRAILERS: usize = MAX_HEADERS;

/// Largest data frame yielded by [`decode_chunked`], whatever the chunk size.
pub const MAX_CHUNK_FRAME: usize = 16 * 1024;

/// Header fields in wire order, duplicates kept where they appeared.
pub type HeaderFields = Vec<(HeaderName, HeaderValue)>;

#[derive(Error, Debug)]
pub enum HeadError {
    #[error("connection closed before a complete head was received")]
    Closed,

    #[error("head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed head: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Request line and headers of an inbound proxy request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub fields: HeaderFields,
}

impl RequestHead {
    /// Parses a complete head from `buf`, returning its length in bytes.
    /// `None` means more input is needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, HeadError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut slots);
        let len = match req.parse(buf).map_err(|e| HeadError::Malformed(e.to_string()))? {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(len) => len,
        };

        let method = req.method.ok_or_else(|| HeadError::Malformed("missing method".into()))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| HeadError::Malformed(e.to_string()))?;
        let target = req.path.ok_or_else(|| HeadError::Malformed("missing request target".into()))?;
        let uri = Uri::from_str(target).map_err(|e| HeadError::Malformed(e.to_string()))?;
        let fields = collect_fields(req.headers)?;

        Ok(Some((len, Self { method, uri, fields })))
    }

    /// Buffers the head without consuming it from `reader`.
    pub async fn peek<S: AsyncRead + Unpin>(
        reader: &mut Lookahead<S>,
        limit: usize,
    ) -> Result<(usize, Self), HeadError> {
        peek_head(reader, limit, Self::parse).await
    }
}

/// Status line and headers of an upstream response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, HeadError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut slots);
        let len = match res.parse(buf).map_err(|e| HeadError::Malformed(e.to_string()))? {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(len) => len,
        };

        let code = res.code.ok_or_else(|| HeadError::Malformed("missing status code".into()))?;
        let status = StatusCode::from_u16(code).map_err(|e| HeadError::Malformed(e.to_string()))?;
        let reason = res.reason.filter(|r| !r.is_empty()).map(str::to_string);
        let headers = collect_fields(res.headers)?.into_iter().fold(
            HeaderMap::with_capacity(res.headers.len()),
            |mut headers, (name, value)| {
                headers.append(name, value);
                headers
            },
        );

        Ok(Some((len, Self { status, reason, headers })))
    }

    /// Reads the head and removes it from `reader`.
    pub async fn read<S: AsyncRead + Unpin>(reader: &mut Lookahead<S>) -> Result<Self, HeadError> {
        let (len, head) = peek_head(reader, MAX_RESPONSE_HEAD, Self::parse).await?;
        reader.discard(len);
        Ok(head)
    }

    /// Interim responses that precede the final one (`100 Continue` etc).
    pub fn is_interim(&self) -> bool {
        self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
    }
}

async fn peek_head<S, T>(
    reader: &mut Lookahead<S>,
    limit: usize,
    parse: fn(&[u8]) -> Result<Option<(usize, T)>, HeadError>,
) -> Result<(usize, T), HeadError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(parsed) = parse(reader.buffer())? {
            return Ok(parsed);
        }
        if reader.buffer().len() >= limit {
            return Err(HeadError::TooLarge(limit));
        }
        if reader.fill().await? == 0 {
            return if reader.is_full() {
                Err(HeadError::TooLarge(limit))
            } else {
                Err(HeadError::Closed)
            };
        }
    }
}

fn collect_fields(raw: &[httparse::Header<'_>]) -> Result<HeaderFields, HeadError> {
    raw.iter()
        .filter(|h| !h.name.is_empty())
        .map(|header| {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| HeadError::Malformed(e.to_string()))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| HeadError::Malformed(e.to_string()))?;
            Ok((name, value))
        })
        .collect()
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilEof,
}

impl BodyFraming {
    /// Framing of a request body as announced by the client.
    pub fn for_request(headers: &HeaderMap) -> Result<Self, HeadError> {
        if is_chunked(headers) {
            return Ok(BodyFraming::Chunked);
        }
        match content_length(headers)? {
            Some(0) | None => Ok(BodyFraming::Empty),
            Some(len) => Ok(BodyFraming::Length(len)),
        }
    }

    /// Framing of a response body, which also depends on the request method.
    pub fn for_response(request_method: &Method, head: &ResponseHead) -> Result<Self, HeadError> {
        let status = head.status;
        if *request_method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(BodyFraming::Empty);
        }
        if is_chunked(&head.headers) {
            return Ok(BodyFraming::Chunked);
        }
        match content_length(&head.headers)? {
            Some(0) => Ok(BodyFraming::Empty),
            Some(len) => Ok(BodyFraming::Length(len)),
            None => Ok(BodyFraming::UntilEof),
        }
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, HeadError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| HeadError::Malformed("invalid Content-Length".into()))?;
        if length.is_some_and(|existing| existing != parsed) {
            return Err(HeadError::Malformed("conflicting Content-Length values".into()));
        }
        length = Some(parsed);
    }
    Ok(length)
}

/// Decodes a chunked body into data frames of at most [`MAX_CHUNK_FRAME`]
/// bytes. Chunk sizes are never trusted for allocation. Trailers are read and
/// dropped.
pub fn decode_chunked<R>(reader: R) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    R: AsyncBufRead + Unpin + Send,
{
    futures::stream::try_unfold((reader, 0u64), |(mut reader, mut remaining)| async move {
        if remaining == 0 {
            let size_line = read_line(&mut reader).await?;
            let size_field = size_line.split(';').next().unwrap_or("").trim();
            remaining = u64::from_str_radix(size_field, 16).map_err(|_| {
                invalid_data(format!("invalid chunk size: {:?}", size_field))
            })?;

            if remaining == 0 {
                skip_trailers(&mut reader).await?;
                return Ok(None);
            }
        }

        let want = remaining.min(MAX_CHUNK_FRAME as u64);
        let mut frame = BytesMut::with_capacity(want as usize);
        let read = (&mut reader).take(want).read_buf(&mut frame).await?;
        if read == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "body ended mid-chunk"));
        }

        remaining -= read as u64;
        if remaining == 0 && !read_line(&mut reader).await?.is_empty() {
            return Err(invalid_data("missing CRLF after chunk".to_string()));
        }
        Ok(Some((frame.freeze(), (reader, remaining))))
    })
}

async fn skip_trailers<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<()> {
    for _ in 0..=MAX_TRAILERS {
        if read_line(reader).await?.is_empty() {
            return Ok(());
        }
    }
    Err(invalid_data(format!("more than {} trailer fields", MAX_TRAILERS)))
}

/// Reads one CRLF-terminated line of at most [`MAX_CHUNK_LINE`] bytes.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut line = Vec::new();
    let read = (&mut *reader).take(MAX_CHUNK_LINE).read_until(b'\n', &mut line).await?;
    if line.last() != Some(&b'\n') {
        return Err(if read as u64 >= MAX_CHUNK_LINE {
            invalid_data(format!("chunk line exceeds {} bytes", MAX_CHUNK_LINE))
        } else {
            io::Error::new(io::ErrorKind::UnexpectedEof, "body ended mid-chunk")
        });
    }

    let line = String::from_utf8(line).map_err(|_| invalid_data("chunk line is not UTF-8".to_string()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
