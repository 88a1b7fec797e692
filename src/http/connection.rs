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
extern crate rustls;
extern crate tokio;
extern crate uuid;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};

use futures::FutureExt;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use uuid::Uuid;

use crate::internet::header::Header;
use crate::io::network::stream;
use crate::io::network::stream::ClientStream;
use crate::util::id_generator::IdGenerator;
use crate::util::log::{platform_log, platform_warn};

use super::config::Timeouts;
use super::decode::{
    decode_head, ChunkDecodeResult, ChunkDecoder, HeaderPartDecodeStatus, ResponseHead,
};
use super::destination::{Destination, Route};
use super::error::{ErrorKind, Result, TimeoutPhase};

const LOG_TAG: &str = "http_connection";

const READ_CHUNK_SIZE: usize = 8 * 1024;

static CONNECTION_ID: IdGenerator = IdGenerator::new();

fn tls_error(e: stream::ErrorKind) -> ErrorKind {
    match e {
        stream::ErrorKind::Io(kind) => ErrorKind::Connect(kind),
        e => ErrorKind::Tls(format!("{:?}", e)),
    }
}

async fn with_deadline<F, T>(timeout: Option<Duration>, phase: TimeoutPhase, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(ErrorKind::Timeout(phase)),
        },
        None => fut.await,
    }
}

async fn handshake(
    stream: ClientStream,
    tls: Arc<rustls::ClientConfig>,
    server_name: &str,
) -> Result<ClientStream> {
    let stream = stream.upgrade(tls, server_name).map_err(tls_error)?;
    stream.do_handshake().await.map_err(tls_error)
}

/// How a response body is delimited on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

enum BodyState {
    Length(u64),
    Chunked(ChunkDecoder),
    UntilClose,
    Done,
}

/// Read position inside one response body.
///
/// Kept apart from the `Connection` so the response can own both without
/// borrowing one from the other, a body can be read exactly once.
pub struct BodyReader {
    state: BodyState,
    trailers: Vec<Header>,
}

impl BodyReader {
    pub fn is_done(&self) -> bool {
        matches!(self.state, BodyState::Done)
    }

    pub fn trailers(&self) -> &[Header] {
        &self.trailers
    }

    pub fn size_hint(&self) -> Option<u64> {
        match self.state {
            BodyState::Length(remaining) => Some(remaining),
            BodyState::Done => Some(0),
            _ => None,
        }
    }
}

/// One TCP or TLS socket bound to a single route.
pub struct Connection {
    id: u64,
    debug_name: String,
    route: Route,
    stream: Option<ClientStream>,
    read_buf: BytesMut,
    timeouts: Timeouts,
    created_at: Instant,
    last_used: Instant,
    exchanges: usize,
    keep_alive: bool,
    drained: bool,
    tunneled: bool,
}

impl Connection {
    /// Opens TCP to the route's peer, and TLS when the peer itself is https.
    ///
    /// Tunnel routes come back as plain TCP to the proxy, the CONNECT exchange
    /// and the TLS upgrade happen later on the same socket.
    pub async fn open(
        route: &Route,
        tls: &Arc<rustls::ClientConfig>,
        timeouts: Timeouts,
    ) -> Result<Connection> {
        let peer = route.peer();
        let id = CONNECTION_ID.generate();
        let debug_name = Uuid::new_v4().to_string();

        platform_log(
            LOG_TAG,
            format!("connection {} opening to {:?}", debug_name, route),
        );

        let connecting = async {
            let stream = ClientStream::new_tokio(&peer.host, peer.port)
                .await
                .map_err(|e| match e {
                    stream::ErrorKind::Io(kind) => ErrorKind::Connect(kind),
                    _ => ErrorKind::Connect(io::ErrorKind::Other),
                })?;

            if let Route::Direct(dst) = route {
                if dst.is_tls() {
                    return handshake(stream, Arc::clone(tls), &dst.host).await;
                }
            }

            Ok(stream)
        };

        let stream = with_deadline(timeouts.connect, TimeoutPhase::Connect, connecting).await?;

        platform_log(
            LOG_TAG,
            format!(
                "connection {} established from {}",
                debug_name,
                stream.get_local_transport_address()
            ),
        );

        let now = Instant::now();

        Ok(Connection {
            id,
            debug_name,
            route: route.clone(),
            stream: Some(stream),
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            timeouts,
            created_at: now,
            last_used: now,
            exchanges: 0,
            keep_alive: true,
            drained: true,
            tunneled: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_tls(&self) -> bool {
        match &self.stream {
            Some(stream) => stream.is_tls(),
            None => false,
        }
    }

    /// Whether a request has already been carried on this socket.
    pub fn is_reused(&self) -> bool {
        self.exchanges > 0
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunneled
    }

    pub(crate) fn set_tunneled(&mut self) {
        self.tunneled = true;
    }

    /// Swaps the transport for TLS on the same socket.
    pub async fn upgrade_tls(
        &mut self,
        tls: &Arc<rustls::ClientConfig>,
        target: &Destination,
    ) -> Result<()> {
        if !self.read_buf.is_empty() {
            self.keep_alive = false;
            return Err(ErrorKind::protocol("unexpected bytes before TLS handshake"));
        }

        match self.stream.take() {
            Some(stream) => {
                let stream = with_deadline(
                    self.timeouts.connect,
                    TimeoutPhase::Connect,
                    handshake(stream, Arc::clone(tls), &target.host),
                )
                .await?;

                platform_log(
                    LOG_TAG,
                    format!("connection {} upgraded to TLS for {:?}", self.debug_name, target),
                );

                self.stream = Some(stream);
                Ok(())
            }

            None => Err(ErrorKind::Io(io::ErrorKind::NotConnected)),
        }
    }

    /// Marks the start of a new request/response exchange.
    pub(crate) fn begin_exchange(&mut self) {
        self.exchanges += 1;
        self.drained = false;
        self.last_used = Instant::now();
    }

    /// Records whether the peer and the request both allow another exchange.
    pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
        if !keep_alive {
            self.keep_alive = false;
        }
    }

    pub(crate) fn mark_broken(&mut self) {
        self.keep_alive = false;
    }

    /// Writes and flushes `data`, bounded by the write timeout.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.timeouts.write;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(ErrorKind::Write(io::ErrorKind::NotConnected)),
        };

        let writing = async {
            stream
                .write_all(data)
                .await
                .map_err(|e| ErrorKind::Write(e.kind()))?;
            stream.flush().await.map_err(|e| ErrorKind::Write(e.kind()))
        };

        let r = with_deadline(timeout, TimeoutPhase::Write, writing).await;
        if r.is_err() {
            self.keep_alive = false;
        }
        r
    }

    /// Reads more bytes into the buffer, 0 means the peer closed.
    async fn fill_buf(&mut self) -> Result<usize> {
        let timeout = self.timeouts.read;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(ErrorKind::Io(io::ErrorKind::NotConnected)),
        };

        if self.read_buf.capacity() - self.read_buf.len() < READ_CHUNK_SIZE / 2 {
            self.read_buf.reserve(READ_CHUNK_SIZE);
        }

        let read_buf = &mut self.read_buf;
        let reading = async { stream.read_buf(read_buf).await.map_err(ErrorKind::from_read) };

        let r = with_deadline(timeout, TimeoutPhase::Read, reading).await;
        if r.is_err() {
            self.keep_alive = false;
        }
        r
    }

    /// Suspends until the first byte of a response is buffered.
    pub async fn await_response(&mut self) -> Result<()> {
        if self.read_buf.is_empty() && self.fill_buf().await? == 0 {
            self.keep_alive = false;
            return Err(ErrorKind::protocol("connection closed before response"));
        }
        Ok(())
    }

    /// Accumulates bytes until the blank line ending a response head.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn read_until_headers_complete(&mut self) -> Result<ResponseHead> {
        loop {
            if !self.read_buf.is_empty() {
                match decode_head(&self.read_buf) {
                    Ok(HeaderPartDecodeStatus::Success(head, size)) => {
                        self.read_buf.advance(size);
                        return Ok(head);
                    }

                    Ok(HeaderPartDecodeStatus::Again) => {}

                    Err(e) => {
                        self.keep_alive = false;
                        return Err(e);
                    }
                }
            }

            if self.fill_buf().await? == 0 {
                self.keep_alive = false;
                return Err(ErrorKind::protocol(if self.read_buf.is_empty() {
                    "connection closed before response"
                } else {
                    "connection closed inside response head"
                }));
            }
        }
    }

    /// Starts reading a body delimited by `framing`.
    pub fn body_reader(&mut self, framing: Framing) -> BodyReader {
        let state = match framing {
            Framing::Empty | Framing::Length(0) => {
                self.drained = self.read_buf.is_empty();
                BodyState::Done
            }
            Framing::Length(length) => BodyState::Length(length),
            Framing::Chunked => BodyState::Chunked(ChunkDecoder::new()),
            Framing::UntilClose => {
                self.keep_alive = false;
                BodyState::UntilClose
            }
        };

        BodyReader {
            state,
            trailers: Vec::new(),
        }
    }

    /// Next piece of the body, `None` once it is exhausted.
    pub async fn read_body(&mut self, reader: &mut BodyReader) -> Result<Option<Bytes>> {
        loop {
            match &mut reader.state {
                BodyState::Done => return Ok(None),

                BodyState::Length(remaining) => {
                    if !self.read_buf.is_empty() {
                        let take = std::cmp::min(*remaining, self.read_buf.len() as u64) as usize;
                        let data = self.read_buf.split_to(take).freeze();
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            reader.state = BodyState::Done;
                            self.on_body_end()?;
                        }
                        return Ok(Some(data));
                    }

                    if self.fill_buf().await? == 0 {
                        self.keep_alive = false;
                        return Err(ErrorKind::protocol("connection closed before end of body"));
                    }
                }

                BodyState::Chunked(decoder) => match decoder.decode(&mut self.read_buf) {
                    Ok(ChunkDecodeResult::Part(data)) => return Ok(Some(data)),

                    Ok(ChunkDecodeResult::EOF(trailers)) => {
                        reader.trailers = trailers;
                        reader.state = BodyState::Done;
                        self.on_body_end()?;
                        return Ok(None);
                    }

                    Ok(ChunkDecodeResult::Again) => {
                        if self.fill_buf().await? == 0 {
                            self.keep_alive = false;
                            return Err(ErrorKind::protocol("connection closed inside chunked body"));
                        }
                    }

                    Err(e) => {
                        self.keep_alive = false;
                        return Err(e);
                    }
                },

                BodyState::UntilClose => {
                    if !self.read_buf.is_empty() {
                        return Ok(Some(self.read_buf.split().freeze()));
                    }

                    if self.fill_buf().await? == 0 {
                        reader.state = BodyState::Done;
                        self.drained = true;
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn on_body_end(&mut self) -> Result<()> {
        if self.read_buf.is_empty() {
            self.drained = true;
            self.last_used = Instant::now();
            Ok(())
        } else {
            self.keep_alive = false;
            Err(ErrorKind::protocol("response body exceeds its declared length"))
        }
    }

    /// Non-suspending check: a quiet idle socket is alive, one that reports
    /// EOF, an error or unsolicited bytes is not.
    pub fn is_alive(&mut self) -> bool {
        if !self.read_buf.is_empty() {
            return false;
        }

        match self.stream.as_mut() {
            Some(stream) => match stream.read_buf(&mut self.read_buf).now_or_never() {
                None => true,
                Some(Ok(0)) => {
                    platform_log(LOG_TAG, format!("connection {} closed by peer", self.debug_name));
                    false
                }
                Some(Ok(_)) => {
                    platform_warn(
                        LOG_TAG,
                        format!("connection {} received unsolicited data", self.debug_name),
                    );
                    false
                }
                Some(Err(_)) => false,
            },

            None => false,
        }
    }

    /// True only for a persistent connection whose last body was fully read.
    pub fn is_reusable(&self) -> bool {
        self.stream.is_some() && self.keep_alive && self.drained && self.read_buf.is_empty()
    }

    pub fn close(mut self) {
        platform_log(
            LOG_TAG,
            format!(
                "connection {} closed after {} exchange(s)",
                self.debug_name, self.exchanges
            ),
        );
        self.stream.take();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({} #{} {:?})", self.debug_name, self.id, self.route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use crate::http::destination::Scheme;

    fn tls() -> Arc<rustls::ClientConfig> {
        crate::http::config::TlsConfig::default().build().unwrap()
    }

    async fn serve_once(reply: &'static [u8]) -> (Route, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(reply).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let route = Route::Direct(Destination::new(Scheme::Http, "127.0.0.1", port));
        (route, handle)
    }

    #[tokio::test]
    async fn reads_sized_body() {
        let (route, server) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
        let mut conn = Connection::open(&route, &tls(), Timeouts::default()).await.unwrap();
        conn.begin_exchange();
        conn.write_chunk(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        let head = conn.read_until_headers_complete().await.unwrap();
        assert_eq!(head.status_code, 200);

        let mut reader = conn.body_reader(Framing::Length(5));
        let mut body = Vec::new();
        while let Some(data) = conn.read_body(&mut reader).await.unwrap() {
            body.extend_from_slice(&data);
        }
        assert_eq!(body, b"hello");
        assert!(conn.is_reusable());
        assert!(conn.is_alive());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn reads_until_close() {
        let (route, server) = serve_once(b"HTTP/1.0 200 OK\r\n\r\nstream").await;
        let mut conn = Connection::open(&route, &tls(), Timeouts::default()).await.unwrap();
        conn.begin_exchange();
        conn.write_chunk(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        conn.read_until_headers_complete().await.unwrap();

        let mut reader = conn.body_reader(Framing::UntilClose);
        let mut body = Vec::new();
        while let Some(data) = conn.read_body(&mut reader).await.unwrap() {
            body.extend_from_slice(&data);
        }
        assert_eq!(body, b"stream");
        assert!(!conn.is_reusable());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn body_past_declared_length() {
        let (route, server) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhello").await;
        let mut conn = Connection::open(&route, &tls(), Timeouts::default()).await.unwrap();
        conn.begin_exchange();
        conn.write_chunk(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        conn.read_until_headers_complete().await.unwrap();

        let mut reader = conn.body_reader(Framing::Length(2));
        let mut result = Ok(None);
        for _ in 0..4 {
            result = conn.read_body(&mut reader).await;
            if !matches!(result, Ok(Some(_))) {
                break;
            }
        }
        assert!(matches!(result, Err(ErrorKind::Protocol(_))));
        assert!(!conn.is_reusable());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn early_close_is_protocol_error() {
        let (route, server) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").await;
        let mut conn = Connection::open(&route, &tls(), Timeouts::default()).await.unwrap();
        conn.begin_exchange();
        conn.write_chunk(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        conn.read_until_headers_complete().await.unwrap();

        let mut reader = conn.body_reader(Framing::Length(10));
        assert_eq!(&conn.read_body(&mut reader).await.unwrap().unwrap()[..], b"abc");
        server.await.unwrap();
        assert!(matches!(
            conn.read_body(&mut reader).await,
            Err(ErrorKind::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn refused_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let route = Route::Direct(Destination::new(Scheme::Http, "127.0.0.1", port));
        let r = Connection::open(&route, &tls(), Timeouts::default()).await;
        assert!(matches!(r, Err(ErrorKind::Connect(_))));
    }
}
