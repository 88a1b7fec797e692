// Copyright 2023 宋昊文
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate bytes;
extern crate futures;
extern crate url;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use futures::stream::{Stream, StreamExt};

use tokio::sync::Mutex;

use url::Url;

use crate::internet::header::{self, Header, HeaderSearch};
use crate::util::log::platform_log;

use super::body::BodyStream;
use super::connection::{BodyReader, Framing};
use super::decode::ResponseHead;
use super::decompress::{Decompressor, Encoding};
use super::error::{ErrorKind, Result};
use super::pool::{ConnectionPool, PooledConnection};
use super::request::Method;

const LOG_TAG: &str = "http_client";

/// Raw bytes still read after a decoded body ends, beyond that the
/// connection is closed instead of reused.
const TRAILING_DRAIN_LIMIT: usize = 64 * 1024;

impl ResponseHead {
    /// How the body following this head is delimited.
    pub fn framing(&self, method: Method) -> Result<Framing> {
        if method == Method::Head
            || self.status_code < 200
            || self.status_code == 204
            || self.status_code == 304
        {
            return Ok(Framing::Empty);
        }

        if method == Method::Connect && (200..300).contains(&self.status_code) {
            return Ok(Framing::Empty);
        }

        let mut transfer_codings = Vec::new();
        for h in HeaderSearch::new(&self.headers, b"Transfer-Encoding", true) {
            for value in h.get_value().split(|c| *c == b',') {
                let value = header::trim(value);
                if !value.is_empty() {
                    transfer_codings.push(value);
                }
            }
        }

        if let Some(last) = transfer_codings.last() {
            if last.eq_ignore_ascii_case(b"chunked") {
                if transfer_codings[..transfer_codings.len() - 1]
                    .iter()
                    .any(|v| v.eq_ignore_ascii_case(b"chunked"))
                {
                    return Err(ErrorKind::protocol("chunked applied more than once"));
                }
                return Ok(Framing::Chunked);
            }

            if transfer_codings.iter().any(|v| v.eq_ignore_ascii_case(b"chunked")) {
                return Err(ErrorKind::protocol("chunked is not the final transfer coding"));
            }

            return Ok(Framing::UntilClose);
        }

        let mut length: Option<u64> = None;
        for h in HeaderSearch::new(&self.headers, b"Content-Length", true) {
            for value in h.get_value().split(|c| *c == b',') {
                let value = header::trim(value);
                let parsed = std::str::from_utf8(value)
                    .ok()
                    .filter(|v| !v.is_empty() && v.bytes().all(|c| c.is_ascii_digit()))
                    .and_then(|v| v.parse::<u64>().ok());
                match (parsed, length) {
                    (None, _) => return Err(ErrorKind::protocol("invalid Content-Length")),
                    (Some(n), Some(l)) if n != l => {
                        return Err(ErrorKind::protocol("conflicting Content-Length values"))
                    }
                    (Some(n), _) => length = Some(n),
                }
            }
        }

        match length {
            Some(0) => Ok(Framing::Empty),
            Some(n) => Ok(Framing::Length(n)),
            None => Ok(Framing::UntilClose),
        }
    }

    /// Whether the peer allows another request on this connection.
    pub fn keep_alive(&self) -> bool {
        if header::has_token(&self.headers, b"Connection", b"close") {
            return false;
        }

        match self.version {
            0 => header::has_token(&self.headers, b"Connection", b"keep-alive"),
            _ => true,
        }
    }
}

/// Body bytes straight off the connection.
///
/// Gives the connection back to the pool once the last byte is read and
/// discards it on error. Dropped early, the lease closes the socket.
struct RawBody {
    conn: Option<PooledConnection>,
    reader: BodyReader,
    pool: ConnectionPool,
}

impl RawBody {
    fn finish(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Ok(None),
        };

        match conn.read_body(&mut self.reader).await {
            Ok(Some(data)) => {
                if self.reader.is_done() {
                    self.finish();
                }
                Ok(Some(data))
            }

            Ok(None) => {
                self.finish();
                Ok(None)
            }

            Err(e) => {
                if let Some(conn) = self.conn.take() {
                    platform_log(LOG_TAG, format!("body of {:?} failed: {}", *conn, e));
                    self.pool.discard(conn);
                }
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }

    /// Reads whatever follows the end of the encoded payload, such as the
    /// last chunk and trailers, so the connection can go back to the pool.
    async fn drain(&mut self, limit: usize) -> Result<()> {
        let mut drained = 0;
        while let Some(data) = self.next_chunk().await? {
            drained += data.len();
            if drained > limit {
                platform_log(LOG_TAG, "too much data after the encoded body");
                self.close();
                return Ok(());
            }
        }
        Ok(())
    }
}

fn into_io_error(e: ErrorKind) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn from_io_error(e: io::Error) -> ErrorKind {
    if e.get_ref().map_or(false, |inner| inner.is::<ErrorKind>()) {
        if let Some(inner) = e.into_inner() {
            if let Ok(kind) = inner.downcast::<ErrorKind>() {
                return *kind;
            }
        }
        return ErrorKind::Io(io::ErrorKind::Other);
    }
    ErrorKind::Decode(e.to_string())
}

enum Inner {
    Empty,
    Raw(RawBody),
    /// The decoder reads from `raw` too, it stops pulling once the encoded
    /// payload is complete.
    Decoded {
        stream: BodyStream,
        raw: Arc<Mutex<RawBody>>,
    },
}

/// Lazily read response body, consumed exactly once.
pub struct ResponseBody {
    inner: Inner,
    trailers: Vec<Header>,
}

impl ResponseBody {
    pub(crate) fn empty() -> ResponseBody {
        ResponseBody {
            inner: Inner::Empty,
            trailers: Vec::new(),
        }
    }

    pub(crate) fn new(
        conn: PooledConnection,
        reader: BodyReader,
        pool: ConnectionPool,
        encodings: Option<Vec<Encoding>>,
    ) -> ResponseBody {
        let mut raw = RawBody {
            conn: Some(conn),
            reader,
            pool,
        };

        if raw.reader.is_done() {
            raw.finish();
            return ResponseBody::empty();
        }

        let inner = match encodings {
            Some(encodings) => {
                let raw = Arc::new(Mutex::new(raw));
                let source: BodyStream = Box::pin(futures::stream::try_unfold(
                    Arc::clone(&raw),
                    |raw| async move {
                        let r = raw.lock().await.next_chunk().await;
                        match r {
                            Ok(Some(data)) => Ok(Some((data, raw))),
                            Ok(None) => Ok(None),
                            Err(e) => Err(into_io_error(e)),
                        }
                    },
                ));
                Inner::Decoded {
                    stream: Decompressor::new(&encodings, source).into_stream(),
                    raw,
                }
            }

            None => Inner::Raw(raw),
        };

        ResponseBody {
            inner,
            trailers: Vec::new(),
        }
    }

    /// Next piece of the body, `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.inner {
            Inner::Empty => Ok(None),

            Inner::Raw(raw) => {
                let r = raw.next_chunk().await;
                if let Ok(None) = r {
                    self.trailers = raw.reader.trailers().to_vec();
                    self.inner = Inner::Empty;
                }
                r
            }

            Inner::Decoded { stream, raw } => match stream.next().await {
                Some(Ok(data)) => Ok(Some(data)),
                Some(Err(e)) => {
                    self.close();
                    Err(from_io_error(e))
                }
                None => {
                    let r = {
                        let mut raw = raw.lock().await;
                        let r = raw.drain(TRAILING_DRAIN_LIMIT).await;
                        self.trailers = raw.reader.trailers().to_vec();
                        r
                    };
                    self.inner = Inner::Empty;
                    r.map(|_| None)
                }
            },
        }
    }

    /// Abandons the rest of the body, the connection is closed rather than reused.
    pub fn close(&mut self) {
        match &mut self.inner {
            Inner::Raw(raw) => raw.close(),
            Inner::Decoded { raw, .. } => {
                if let Ok(mut raw) = raw.try_lock() {
                    raw.close();
                }
            }
            Inner::Empty => {}
        }
        self.inner = Inner::Empty;
    }

    pub fn is_end(&self) -> bool {
        matches!(self.inner, Inner::Empty)
    }

    pub fn trailers(&self) -> &[Header] {
        &self.trailers
    }
}

pub struct Response {
    pub status: u16,
    pub reason: String,
    /// Minor version, `HTTP/1.x`.
    pub version: u8,
    pub headers: Vec<Header>,
    /// Final URL after redirects.
    pub url: Url,
    /// URLs that redirected here, oldest first.
    pub history: Vec<Url>,
    body: ResponseBody,
}

impl Response {
    pub(crate) fn new(head: ResponseHead, url: Url, body: ResponseBody) -> Response {
        Response {
            status: head.status_code,
            reason: head.reason_phrase,
            version: head.version,
            headers: head.headers,
            url,
            history: Vec::new(),
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header::get_str(&self.headers, name.as_bytes())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
            && header::contains(&self.headers, b"Location")
    }

    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.chunk().await
    }

    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(data) = self.body.chunk().await? {
            buf.extend_from_slice(&data);
        }
        Ok(buf.freeze())
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn bytes_stream(self) -> impl Stream<Item = Result<Bytes>> {
        futures::stream::try_unfold(self.body, |mut body| async move {
            match body.chunk().await? {
                Some(data) => Ok(Some((data, body))),
                None => Ok(None),
            }
        })
    }

    /// Body split on `\n`, a trailing `\r` is removed from each line.
    pub fn lines(self) -> impl Stream<Item = Result<Bytes>> {
        split_stream(self.bytes_stream(), b"\n".to_vec(), true)
    }

    /// Body split on `delimiter`, the delimiter itself is not returned.
    pub fn split(self, delimiter: &[u8]) -> impl Stream<Item = Result<Bytes>> {
        split_stream(self.bytes_stream(), delimiter.to_vec(), false)
    }

    pub fn close(&mut self) {
        self.body.close();
    }

    pub fn is_body_consumed(&self) -> bool {
        self.body.is_end()
    }

    /// Trailer headers of a chunked body, available once it was read to the end.
    pub fn trailers(&self) -> &[Header] {
        self.body.trailers()
    }

    /// Reads and throws away at most `limit` bytes so the connection can
    /// be reused, closing it when the body is longer.
    pub(crate) async fn drain(&mut self, limit: usize) {
        let mut drained = 0;
        loop {
            match self.body.chunk().await {
                Ok(Some(data)) => {
                    drained += data.len();
                    if drained > limit {
                        self.body.close();
                        return;
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    }
}

struct Splitter<S> {
    source: Pin<Box<S>>,
    delimiter: Vec<u8>,
    strip_cr: bool,
    pending: BytesMut,
    ready: VecDeque<Bytes>,
    done: bool,
}

impl<S> Splitter<S> {
    fn cut(&self, mut line: BytesMut) -> Bytes {
        if self.strip_cr && line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        line.freeze()
    }

    fn split_ready(&mut self, from: usize) {
        let n = self.delimiter.len();
        let mut start = from;
        loop {
            let found = self.pending[start..]
                .windows(n)
                .position(|w| w == &self.delimiter[..]);
            let pos = match found {
                Some(pos) => pos,
                None => break,
            };
            let mut line = self.pending.split_to(start + pos + n);
            line.truncate(start + pos);
            let line = self.cut(line);
            self.ready.push_back(line);
            start = 0;
        }
    }
}

/// Re-chunks `source` into delimited records, carrying partial records over
/// chunk boundaries.
fn split_stream<S>(source: S, delimiter: Vec<u8>, strip_cr: bool) -> impl Stream<Item = Result<Bytes>>
where
    S: Stream<Item = Result<Bytes>>,
{
    let splitter = Splitter {
        source: Box::pin(source),
        delimiter,
        strip_cr,
        pending: BytesMut::new(),
        ready: VecDeque::new(),
        done: false,
    };

    futures::stream::try_unfold(splitter, |mut splitter| async move {
        loop {
            if let Some(line) = splitter.ready.pop_front() {
                return Ok(Some((line, splitter)));
            }

            if splitter.done || splitter.delimiter.is_empty() {
                return Ok(None);
            }

            match splitter.source.next().await {
                Some(data) => {
                    let data = data?;
                    let from = splitter
                        .pending
                        .len()
                        .saturating_sub(splitter.delimiter.len() - 1);
                    splitter.pending.extend_from_slice(&data);
                    splitter.split_ready(from);
                }

                None => {
                    splitter.done = true;
                    if !splitter.pending.is_empty() {
                        let rest = splitter.pending.split();
                        let line = splitter.cut(rest);
                        splitter.ready.push_back(line);
                    }
                }
            }
        }
    })
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HTTP/1.{} {} {} ({})",
            self.version, self.status, self.reason, self.url
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn split_all(chunks: &[&'static [u8]], delimiter: &[u8], strip_cr: bool) -> Vec<Bytes> {
        let source = futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<Result<Bytes>>>(),
        );
        split_stream(source, delimiter.to_vec(), strip_cr)
            .map(|line| line.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn lines_span_chunks() {
        let lines = split_all(&[b"ab\ncd", b"e\r\n\nf"], b"\n", true).await;
        assert_eq!(
            lines,
            vec![
                Bytes::from_static(b"ab"),
                Bytes::from_static(b"cde"),
                Bytes::new(),
                Bytes::from_static(b"f")
            ]
        );

        let lines = split_all(&[b"one\n", b"two\n"], b"\n", true).await;
        assert_eq!(lines, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[tokio::test]
    async fn delimiter_split_across_chunks() {
        let lines = split_all(&[b"a|", b"|b|", b"|"], b"||", false).await;
        assert_eq!(lines, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    fn head(version: u8, status: u16, headers: Vec<Header>) -> ResponseHead {
        ResponseHead {
            version,
            status_code: status,
            reason_phrase: String::new(),
            headers,
        }
    }

    #[test]
    fn framing_rules() {
        let h = head(1, 200, vec![Header::new("Content-Length", "12")]);
        assert_eq!(h.framing(Method::Get).unwrap(), Framing::Length(12));
        assert_eq!(h.framing(Method::Head).unwrap(), Framing::Empty);

        let h = head(1, 204, vec![]);
        assert_eq!(h.framing(Method::Get).unwrap(), Framing::Empty);

        let h = head(1, 200, vec![]);
        assert_eq!(h.framing(Method::Connect).unwrap(), Framing::Empty);
        assert_eq!(h.framing(Method::Get).unwrap(), Framing::UntilClose);

        let h = head(
            1,
            200,
            vec![
                Header::new("Transfer-Encoding", "gzip, chunked"),
                Header::new("Content-Length", "3"),
            ],
        );
        assert_eq!(h.framing(Method::Get).unwrap(), Framing::Chunked);

        let h = head(1, 200, vec![Header::new("Transfer-Encoding", "gzip")]);
        assert_eq!(h.framing(Method::Get).unwrap(), Framing::UntilClose);
    }

    #[test]
    fn framing_errors() {
        let h = head(
            1,
            200,
            vec![
                Header::new("Content-Length", "3"),
                Header::new("Content-Length", "4"),
            ],
        );
        assert!(matches!(h.framing(Method::Get), Err(ErrorKind::Protocol(_))));

        let h = head(1, 200, vec![Header::new("Content-Length", "-1")]);
        assert!(matches!(h.framing(Method::Get), Err(ErrorKind::Protocol(_))));

        let h = head(1, 200, vec![Header::new("Transfer-Encoding", "chunked, gzip")]);
        assert!(matches!(h.framing(Method::Get), Err(ErrorKind::Protocol(_))));

        let h = head(1, 200, vec![Header::new("Content-Length", "5, 5")]);
        assert_eq!(h.framing(Method::Get).unwrap(), Framing::Length(5));
    }

    #[test]
    fn persistent_connection_rules() {
        assert!(head(1, 200, vec![]).keep_alive());
        assert!(!head(1, 200, vec![Header::new("Connection", "close")]).keep_alive());
        assert!(!head(0, 200, vec![]).keep_alive());
        assert!(head(0, 200, vec![Header::new("Connection", "Keep-Alive")]).keep_alive());
    }
}
