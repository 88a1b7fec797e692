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
extern crate url;

use std::io;
use std::sync::Arc;

use bytes::BytesMut;

use futures::StreamExt;

use url::Url;

use crate::internet::header::{self, Header};
use crate::util::log::platform_log;

use super::body::Body;
use super::connection::{BodyReader, Connection};
use super::decode::{encode_chunk, encode_last_chunk, ResponseHead};
use super::decompress::content_encodings;
use super::destination::{Destination, Route};
use super::error::{ErrorKind, Result};
use super::pool::{ConnectionPool, PooledConnection};
use super::request::Method;
use super::response::{Response, ResponseBody};
use super::tunnel::tunnel;

const LOG_TAG: &str = "http_pipeline";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Sending,
    AwaitingResponse,
    ReceivingHeaders,
    StreamingBody,
    Done,
    Errored,
}

/// One request, resolved down to what goes on the wire.
pub struct Outgoing<'a> {
    pub method: Method,
    pub url: &'a Url,
    pub route: &'a Route,
    pub target: String,
    pub headers: Vec<Header>,
    pub body: Body,
    /// Sent on CONNECT when the route is a tunnel.
    pub proxy_authorization: Option<&'a str>,
    /// Undo `Content-Encoding` while reading the body.
    pub decode: bool,
}

/// Wire headers for a request: `Host` first, caller headers in order, body
/// framing computed from the body. Returns whether the body is chunked.
pub fn prepare_headers(
    method: Method,
    dst: &Destination,
    headers: &[Header],
    body: &Body,
    extra: Vec<Header>,
) -> Result<(Vec<Header>, bool)> {
    let mut prepared = Vec::with_capacity(headers.len() + extra.len() + 2);

    if !header::contains(headers, b"Host") {
        prepared.push(Header::new("Host", dst.host_header()));
    }

    for h in headers.iter().chain(extra.iter()) {
        if !h.is_well_formed() {
            return Err(ErrorKind::InvalidHeader(
                String::from_utf8_lossy(h.get_name()).into_owned(),
            ));
        }
        if h.name_is(b"Content-Length") || h.name_is(b"Transfer-Encoding") {
            continue;
        }
        prepared.push(h.clone());
    }

    let chunked = match body.content_length() {
        Some(0) => {
            if method.expects_body() {
                prepared.push(Header::new("Content-Length", "0"));
            }
            false
        }
        Some(length) => {
            prepared.push(Header::new("Content-Length", length.to_string()));
            false
        }
        None => {
            prepared.push(Header::new("Transfer-Encoding", "chunked"));
            true
        }
    };

    Ok((prepared, chunked))
}

async fn send_body(conn: &mut Connection, body: Body, chunked: bool) -> Result<()> {
    match body {
        Body::Empty => Ok(()),

        Body::Bytes(data) => conn.write_chunk(&data).await,

        Body::Stream { mut stream, length } => {
            let mut sent: u64 = 0;
            let mut buf = BytesMut::new();

            while let Some(item) = stream.next().await {
                let data = item.map_err(|e| ErrorKind::Body(e.to_string()))?;
                if data.is_empty() {
                    continue;
                }

                sent += data.len() as u64;
                if let Some(length) = length {
                    if sent > length {
                        return Err(ErrorKind::Body(format!(
                            "stream yielded more than the declared {} bytes",
                            length
                        )));
                    }
                }

                if chunked {
                    buf.clear();
                    encode_chunk(&data, &mut buf);
                    conn.write_chunk(&buf).await?;
                } else {
                    conn.write_chunk(&data).await?;
                }
            }

            if let Some(length) = length {
                if sent < length {
                    return Err(ErrorKind::Body(format!(
                        "stream ended after {} of the declared {} bytes",
                        sent, length
                    )));
                }
            }

            if chunked {
                buf.clear();
                encode_last_chunk(&[], &mut buf);
                conn.write_chunk(&buf).await?;
            }

            Ok(())
        }
    }
}

/// Holds the body back until `100 Continue`, a final response, or the wait
/// elapses. A final response is returned so the body is never sent.
async fn wait_for_continue(conn: &mut Connection) -> Result<Option<ResponseHead>> {
    let deadline = tokio::time::Instant::now() + conn.timeouts().expect_continue;

    loop {
        match tokio::time::timeout_at(deadline, conn.read_until_headers_complete()).await {
            Err(_) => {
                platform_log(LOG_TAG, "no 100 Continue in time, sending body anyway");
                return Ok(None);
            }

            Ok(Err(e)) => return Err(e),

            Ok(Ok(head)) => {
                if head.status_code == 100 {
                    return Ok(None);
                } else if head.status_code < 200 && head.status_code != 101 {
                    continue;
                } else {
                    return Ok(Some(head));
                }
            }
        }
    }
}

/// Drives one request over one connection.
///
/// Any error discards the connection, a response is only handed out once
/// its head was read completely.
pub struct Pipeline<'a> {
    pool: &'a ConnectionPool,
    tls: &'a Arc<rustls::ClientConfig>,
    state: State,
    conn: Option<PooledConnection>,
}

impl<'a> Pipeline<'a> {
    pub fn new(pool: &'a ConnectionPool, tls: &'a Arc<rustls::ClientConfig>) -> Pipeline<'a> {
        Pipeline {
            pool,
            tls,
            state: State::Idle,
            conn: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn transition(&mut self, to: State) {
        platform_log(LOG_TAG, format!("{:?} -> {:?}", self.state, to));
        self.state = to;
    }

    fn conn_mut(&mut self) -> Result<&mut PooledConnection> {
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(ErrorKind::Io(io::ErrorKind::NotConnected)),
        }
    }

    fn fail(&mut self, e: &ErrorKind) {
        platform_log(LOG_TAG, format!("{:?} -> Errored: {}", self.state, e));
        self.state = State::Errored;
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }

    pub async fn run(&mut self, outgoing: Outgoing<'_>) -> Result<Response> {
        match self.drive(outgoing).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self, mut outgoing: Outgoing<'_>) -> Result<Response> {
        let tls = self.tls;
        let mut body = Some(std::mem::take(&mut outgoing.body));
        let mut early_head: Option<ResponseHead> = None;
        let mut received: Option<(ResponseHead, BodyReader)> = None;

        loop {
            match self.state {
                State::Idle => self.transition(State::Connecting),

                State::Connecting => {
                    let conn = self.pool.acquire(outgoing.route).await?;
                    self.conn = Some(conn);

                    if let Route::Tunnel { target, .. } = outgoing.route {
                        let conn = self.conn_mut()?;
                        if !conn.is_tunneled() {
                            tunnel(conn, target, outgoing.proxy_authorization, tls).await?;
                        }
                    }

                    self.transition(State::Sending);
                }

                State::Sending => {
                    let body = body.take().unwrap_or_default();
                    let (headers, chunked) = (&outgoing.headers, body.content_length().is_none());
                    let expect_continue =
                        header::has_token(headers, b"Expect", b"100-continue") && !body.is_empty();

                    let conn = self.conn_mut()?;
                    let reused = conn.is_reused();
                    conn.begin_exchange();
                    if header::has_token(headers, b"Connection", b"close") {
                        conn.set_keep_alive(false);
                    }

                    platform_log(
                        LOG_TAG,
                        format!(
                            "{:?} {} {} reused={}",
                            **conn, outgoing.method, outgoing.target, reused
                        ),
                    );

                    let mut buf = BytesMut::with_capacity(512);
                    outgoing.request_head(&mut buf);

                    match body {
                        Body::Bytes(data) if !expect_continue => {
                            buf.extend_from_slice(&data);
                            conn.write_chunk(&buf).await?;
                        }

                        body => {
                            conn.write_chunk(&buf).await?;
                            if expect_continue {
                                match wait_for_continue(conn).await? {
                                    Some(head) => {
                                        platform_log(
                                            LOG_TAG,
                                            format!("final {} before body, body not sent", head.status_code),
                                        );
                                        conn.mark_broken();
                                        early_head = Some(head);
                                    }
                                    None => send_body(conn, body, chunked).await?,
                                }
                            } else {
                                send_body(conn, body, chunked).await?;
                            }
                        }
                    }

                    self.transition(State::AwaitingResponse);
                }

                State::AwaitingResponse => {
                    if early_head.is_none() {
                        self.conn_mut()?.await_response().await?;
                    }
                    self.transition(State::ReceivingHeaders);
                }

                State::ReceivingHeaders => {
                    let conn = self.conn_mut()?;
                    let head = match early_head.take() {
                        Some(head) => head,
                        None => conn.read_until_headers_complete().await?,
                    };

                    if head.status_code == 101 {
                        return Err(ErrorKind::protocol("unexpected 101 Switching Protocols"));
                    }

                    if head.status_code < 200 {
                        platform_log(LOG_TAG, format!("skipping interim {}", head.status_code));
                        continue;
                    }

                    let framing = head.framing(outgoing.method)?;
                    conn.set_keep_alive(head.keep_alive());
                    let reader = conn.body_reader(framing);

                    platform_log(
                        LOG_TAG,
                        format!("{:?} {} framed as {:?}", **conn, head.status_code, framing),
                    );

                    received = Some((head, reader));
                    self.transition(State::StreamingBody);
                }

                State::StreamingBody => {
                    let (mut head, reader) = match received.take() {
                        Some(received) => received,
                        None => return Err(ErrorKind::protocol("no response head")),
                    };

                    let conn = match self.conn.take() {
                        Some(conn) => conn,
                        None => return Err(ErrorKind::Io(io::ErrorKind::NotConnected)),
                    };

                    let encodings = if outgoing.decode && !reader.is_done() {
                        content_encodings(&head.headers)
                    } else {
                        None
                    };

                    if encodings.is_some() {
                        header::remove(&mut head.headers, b"Content-Encoding");
                        header::remove(&mut head.headers, b"Content-Length");
                    }

                    let body = ResponseBody::new(conn, reader, self.pool.clone(), encodings);
                    self.transition(State::Done);

                    return Ok(Response::new(head, outgoing.url.clone(), body));
                }

                State::Done | State::Errored => {
                    return Err(ErrorKind::protocol("request already finished"));
                }
            }
        }
    }
}

impl Outgoing<'_> {
    fn request_head(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.target.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");
        header::encode_headers(&self.headers, buf);
        buf.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use bytes::Bytes;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    use crate::http::config::{PoolConfig, Timeouts, TlsConfig};
    use crate::http::destination::Scheme;

    async fn read_until(socket: &mut TcpStream, seen: &mut Vec<u8>, needle: &[u8]) {
        let mut buf = [0u8; 1024];
        while !seen.windows(needle.len()).any(|w| w == needle) {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client went away");
            seen.extend_from_slice(&buf[..n]);
        }
    }

    /// Answers one request with `replies`, handing back what the client sent.
    async fn server(
        replies: Vec<(&'static [u8], &'static [u8])>,
    ) -> (u16, oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            for (wait_for, reply) in replies {
                read_until(&mut socket, &mut seen, wait_for).await;
                socket.write_all(reply).await.unwrap();
            }
            let _ = tx.send(seen);
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });
        (port, rx)
    }

    async fn send(port: u16, method: Method, headers: Vec<Header>, body: Body) -> (Response, ConnectionPool) {
        send_with(Timeouts::default(), port, method, headers, body).await
    }

    async fn send_with(
        timeouts: Timeouts,
        port: u16,
        method: Method,
        headers: Vec<Header>,
        body: Body,
    ) -> (Response, ConnectionPool) {
        let tls = TlsConfig::default().build().unwrap();
        let pool = ConnectionPool::new(PoolConfig::default(), Arc::clone(&tls), timeouts);
        let url = Url::parse(&format!("http://127.0.0.1:{}/upload", port)).unwrap();
        let dst = Destination::from_url(&url).unwrap();
        let route = Route::Direct(dst.clone());
        let (headers, _) = prepare_headers(method, &dst, &headers, &body, Vec::new()).unwrap();

        let mut pipeline = Pipeline::new(&pool, &tls);
        let response = pipeline
            .run(Outgoing {
                method,
                url: &url,
                route: &route,
                target: String::from("/upload"),
                headers,
                body,
                proxy_authorization: None,
                decode: false,
            })
            .await
            .unwrap();
        assert_eq!(pipeline.state(), State::Done);
        (response, pool)
    }

    #[test]
    fn framing_headers() {
        let dst = Destination::new(Scheme::Http, "example.com", 80);
        let (headers, chunked) = prepare_headers(
            Method::Post,
            &dst,
            &[
                Header::new("Content-Length", "99"),
                Header::new("X-Trace", "1"),
            ],
            &Body::Empty,
            vec![Header::new("Accept-Encoding", "gzip")],
        )
        .unwrap();

        assert!(!chunked);
        let names: Vec<&[u8]> = headers.iter().map(|h| h.get_name()).collect();
        assert_eq!(
            names,
            vec![
                &b"Host"[..],
                &b"X-Trace"[..],
                &b"Accept-Encoding"[..],
                &b"Content-Length"[..]
            ]
        );
        assert_eq!(header::get_str(&headers, b"Host"), Some("example.com"));
        assert_eq!(header::get_str(&headers, b"Content-Length"), Some("0"));

        let (headers, _) =
            prepare_headers(Method::Get, &dst, &[], &Body::Empty, Vec::new()).unwrap();
        assert!(!header::contains(&headers, b"Content-Length"));

        let stream = Body::wrap_stream(futures::stream::empty::<io::Result<Bytes>>(), None);
        let (headers, chunked) =
            prepare_headers(Method::Put, &dst, &[], &stream, Vec::new()).unwrap();
        assert!(chunked);
        assert_eq!(header::get_str(&headers, b"Transfer-Encoding"), Some("chunked"));

        assert!(matches!(
            prepare_headers(
                Method::Get,
                &dst,
                &[Header::new("X-Bad", "a\r\nInjected: 1")],
                &Body::Empty,
                Vec::new()
            ),
            Err(ErrorKind::InvalidHeader(_))
        ));
    }

    #[tokio::test]
    async fn skips_interim_responses() {
        let (port, _) = server(vec![(
            b"\r\n\r\n",
            b"HTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        )])
        .await;

        let (response, pool) = send(port, Method::Get, Vec::new(), Body::Empty).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.header("Link"), None);
        assert_eq!(&response.bytes().await.unwrap()[..], b"ok");
        assert_eq!(pool.num_idle(), 1);
    }

    #[tokio::test]
    async fn sends_body_after_continue() {
        let (port, sent) = server(vec![
            (b"\r\n\r\n", b"HTTP/1.1 100 Continue\r\n\r\n"),
            (b"hello", b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n"),
        ])
        .await;

        let (response, pool) = send(
            port,
            Method::Post,
            vec![Header::new("Expect", "100-continue")],
            Body::from("hello"),
        )
        .await;
        assert_eq!(response.status, 201);
        assert!(response.is_body_consumed());
        assert_eq!(pool.num_idle(), 1);

        let sent = String::from_utf8(sent.await.unwrap()).unwrap();
        assert!(sent.starts_with("POST /upload HTTP/1.1\r\nHost: 127.0.0.1:"));
        assert!(sent.ends_with("Content-Length: 5\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn sends_body_when_continue_never_comes() {
        let (port, sent) = server(vec![(
            b"hello",
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone",
        )])
        .await;

        let timeouts = Timeouts {
            expect_continue: Duration::from_millis(100),
            ..Timeouts::default()
        };
        let started = std::time::Instant::now();
        let (response, pool) = send_with(
            timeouts,
            port,
            Method::Post,
            vec![Header::new("Expect", "100-continue")],
            Body::from("hello"),
        )
        .await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(response.status, 200);
        assert_eq!(&response.bytes().await.unwrap()[..], b"done");
        assert_eq!(pool.num_idle(), 1);

        let sent = String::from_utf8(sent.await.unwrap()).unwrap();
        assert!(sent.contains("Expect: 100-continue\r\n"));
        assert!(sent.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn final_response_skips_body() {
        let (port, sent) = server(vec![(
            b"\r\n\r\n",
            b"HTTP/1.1 417 Expectation Failed\r\nContent-Length: 0\r\n\r\n",
        )])
        .await;

        let (response, pool) = send(
            port,
            Method::Put,
            vec![Header::new("Expect", "100-continue")],
            Body::from("never sent"),
        )
        .await;
        assert_eq!(response.status, 417);
        drop(response);
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_total(), 0);

        let sent = sent.await.unwrap();
        assert!(sent.ends_with(b"\r\n\r\n"));
    }

    #[tokio::test]
    async fn streams_chunked_body() {
        let (port, sent) = server(vec![(
            b"0\r\n\r\n",
            b"HTTP/1.1 204 No Content\r\n\r\n",
        )])
        .await;

        let parts: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"defgh")),
        ];
        let body = Body::wrap_stream(futures::stream::iter(parts), None);

        let (response, _pool) = send(port, Method::Post, Vec::new(), body).await;
        assert_eq!(response.status, 204);

        let sent = String::from_utf8(sent.await.unwrap()).unwrap();
        assert!(sent.contains("Transfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n5\r\ndefgh\r\n0\r\n\r\n"));
    }
}
