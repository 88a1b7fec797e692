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

extern crate rustls;
extern crate tokio;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::{
    fmt, io,
    io::{Read, Write},
};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Stream};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::util::log::platform_log;

const LOG_TAG: &str = "stream";

pub enum ClientStream {
    Tcp(TcpStream),
    Tls(Box<ClientConnection>, TcpStream, TlsState),
}

impl ClientStream {
    pub async fn new_tokio(host: &str, port: u16) -> Result<ClientStream> {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                Ok(ClientStream::Tcp(stream))
            }
            Err(e) => Err(ErrorKind::Io(e.kind())),
        }
    }

    /// Wraps the plain socket with a TLS client session in place.
    ///
    /// The handshake is not driven here, call `do_handshake` on the result.
    pub fn upgrade(self, config: Arc<ClientConfig>, server_name: &str) -> Result<ClientStream> {
        match self {
            ClientStream::Tcp(stream) => match ServerName::try_from(server_name.to_string()) {
                Ok(name) => match ClientConnection::new(config, name) {
                    Ok(client) => Ok(ClientStream::Tls(
                        Box::new(client),
                        stream,
                        TlsState::Connected,
                    )),
                    Err(e) => Err(ErrorKind::Rustls(e.to_string())),
                },
                Err(_) => Err(ErrorKind::InvalidServerName),
            },

            ClientStream::Tls(..) => Err(ErrorKind::AlreadyEncrypted),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls(..))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            ClientStream::Tcp(stream) | ClientStream::Tls(_, stream, _) => stream.peer_addr().ok(),
        }
    }

    pub fn get_local_transport_address(&self) -> String {
        match self {
            ClientStream::Tcp(stream) | ClientStream::Tls(_, stream, _) => {
                if let Ok(l_addr) = stream.local_addr() {
                    return l_addr.to_string();
                }
            }
        }

        String::from("0.0.0.0:0")
    }

    pub fn do_handshake(self) -> Handshaker {
        Handshaker { stream: Some(self) }
    }
}

pub enum TlsState {
    Connected,
    Negotiated,
    Shutdown,
}

pub struct Handshaker {
    stream: Option<ClientStream>,
}

impl Future for Handshaker {
    type Output = Result<ClientStream>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = self.get_mut();
        match task.stream.take() {
            Some(mut stream) => match stream {
                ClientStream::Tcp(_) => Poll::Ready(Ok(stream)),
                ClientStream::Tls(ref mut conn, ref mut tcp_stream, ref mut state) => match *state {
                    TlsState::Connected => {
                        let mut sync_stream = SyncTcpStream {
                            stream: tcp_stream,
                            cx,
                        };
                        while conn.is_handshaking() {
                            match conn.complete_io(&mut sync_stream) {
                                Ok(_) => {}

                                Err(e) => match e.kind() {
                                    io::ErrorKind::WouldBlock => {
                                        task.stream.replace(stream);
                                        return Poll::Pending;
                                    }
                                    io::ErrorKind::InvalidData => {
                                        platform_log(LOG_TAG, format!("handshake rejected: {}", e));
                                        return Poll::Ready(Err(ErrorKind::HandshakeFailure(
                                            e.to_string(),
                                        )));
                                    }
                                    io::ErrorKind::UnexpectedEof => {
                                        return Poll::Ready(Err(ErrorKind::HandshakeFailure(
                                            String::from("peer closed during handshake"),
                                        )));
                                    }
                                    kind => return Poll::Ready(Err(ErrorKind::Io(kind))),
                                },
                            }
                        }

                        if let Some(version) = conn.protocol_version() {
                            platform_log(LOG_TAG, format!("negotiated {:?}", version));
                        }

                        *state = TlsState::Negotiated;
                        Poll::Ready(Ok(stream))
                    }

                    TlsState::Negotiated => Poll::Ready(Ok(stream)),

                    TlsState::Shutdown => Poll::Ready(Err(ErrorKind::Io(io::ErrorKind::NotConnected))),
                },
            },

            None => Poll::Ready(Err(ErrorKind::HandshakeFailure(String::from(
                "handshake polled after completion",
            )))),
        }
    }
}

struct SyncTcpStream<'a, 'b> {
    stream: &'a mut TcpStream,
    cx: &'a mut Context<'b>,
}

impl Read for SyncTcpStream<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut buf = ReadBuf::new(buf);
        match Pin::new(&mut self.stream).poll_read(self.cx, &mut buf) {
            Poll::Ready(Ok(())) => Ok(buf.filled().len()),

            Poll::Ready(Err(e)) => Err(e),

            Poll::Pending => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }
}

impl Write for SyncTcpStream<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match Pin::new(&mut self.stream).poll_write(self.cx, buf) {
            Poll::Ready(Ok(size)) => Ok(size),

            Poll::Ready(Err(e)) => Err(e),

            Poll::Pending => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match Pin::new(&mut self.stream).poll_flush(self.cx) {
            Poll::Ready(ok) => ok,

            Poll::Pending => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Tls(ref mut conn, ref mut stream, state) => match *state {
                TlsState::Connected | TlsState::Negotiated => {
                    let mut stream = SyncTcpStream { stream, cx };
                    let mut tls_stream = Stream::new(&mut **conn, &mut stream);
                    match tls_stream.read(buf.initialize_unfilled()) {
                        Ok(size) => {
                            buf.advance(size);
                            Poll::Ready(Ok(()))
                        }

                        Err(e) => match e.kind() {
                            io::ErrorKind::WouldBlock => Poll::Pending,
                            // peers commonly close without close_notify
                            io::ErrorKind::UnexpectedEof => Poll::Ready(Ok(())),
                            _ => Poll::Ready(Err(e)),
                        },
                    }
                }

                TlsState::Shutdown => Poll::Ready(Ok(())),
            },
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Tls(ref mut conn, ref mut stream, _) => {
                let mut stream = SyncTcpStream { stream, cx };
                let mut tls_stream = Stream::new(&mut **conn, &mut stream);
                match tls_stream.write(buf) {
                    Ok(size) => Poll::Ready(Ok(size)),

                    Err(e) => match e.kind() {
                        io::ErrorKind::WouldBlock => Poll::Pending,
                        _ => Poll::Ready(Err(e)),
                    },
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(ref mut stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Tls(ref mut conn, ref mut stream, _) => {
                let mut stream = SyncTcpStream { stream, cx };
                let mut tls_stream = Stream::new(&mut **conn, &mut stream);
                match tls_stream.flush() {
                    Ok(()) => Poll::Ready(Ok(())),

                    Err(e) => match e.kind() {
                        io::ErrorKind::WouldBlock => Poll::Pending,
                        _ => Poll::Ready(Err(e)),
                    },
                }
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Tls(ref mut conn, ref mut stream, ref mut state) => {
                match *state {
                    TlsState::Connected => {
                        *state = TlsState::Shutdown;
                    }

                    TlsState::Negotiated => {
                        conn.send_close_notify();
                        *state = TlsState::Shutdown;
                    }

                    TlsState::Shutdown => {}
                }

                while conn.wants_write() {
                    let mut sync_stream = SyncTcpStream {
                        stream: &mut *stream,
                        cx: &mut *cx,
                    };
                    match conn.write_tls(&mut sync_stream) {
                        Ok(_) => {}

                        Err(e) => match e.kind() {
                            io::ErrorKind::WouldBlock => {
                                return Poll::Pending;
                            }
                            _ => {
                                return Poll::Ready(Err(e));
                            }
                        },
                    }
                }

                Pin::new(stream).poll_shutdown(cx)
            }
        }
    }
}

pub enum ErrorKind {
    HandshakeFailure(String),
    Io(io::ErrorKind),
    Rustls(String),
    InvalidServerName,
    AlreadyEncrypted,
}

impl Clone for ErrorKind {
    fn clone(&self) -> ErrorKind {
        match self {
            ErrorKind::HandshakeFailure(reason) => ErrorKind::HandshakeFailure(reason.clone()),
            ErrorKind::Io(kind) => ErrorKind::Io(*kind),
            ErrorKind::Rustls(reason) => ErrorKind::Rustls(reason.clone()),
            ErrorKind::InvalidServerName => ErrorKind::InvalidServerName,
            ErrorKind::AlreadyEncrypted => ErrorKind::AlreadyEncrypted,
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::HandshakeFailure(reason) => {
                write!(f, "HandshakeFailure {}", reason)
            }

            ErrorKind::Io(kind) => {
                write!(f, "Io {:?}", kind)
            }

            ErrorKind::Rustls(reason) => {
                write!(f, "Rustls {}", reason)
            }

            ErrorKind::InvalidServerName => {
                write!(f, "InvalidServerName")
            }

            ErrorKind::AlreadyEncrypted => {
                write!(f, "AlreadyEncrypted")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::http::config::TlsConfig;

    async fn plain() -> ClientStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        ClientStream::new_tokio("127.0.0.1", port).await.unwrap()
    }

    #[tokio::test]
    async fn upgrade_wraps_plain_socket_once() {
        let config = TlsConfig::default().build().unwrap();

        let stream = plain().await;
        assert!(!stream.is_tls());
        assert!(stream.peer_addr().is_some());

        let stream = stream.upgrade(Arc::clone(&config), "example.com").unwrap();
        assert!(stream.is_tls());
        assert!(matches!(
            stream.upgrade(config, "example.com"),
            Err(ErrorKind::AlreadyEncrypted)
        ));
    }

    #[tokio::test]
    async fn rejects_bad_server_name() {
        let config = TlsConfig::default().build().unwrap();
        assert!(matches!(
            plain().await.upgrade(config, "not a host"),
            Err(ErrorKind::InvalidServerName)
        ));
    }
}
