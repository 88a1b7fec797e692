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
extern crate rustls;

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::util::log::{platform_log, platform_warn};

use super::connection::Connection;
use super::destination::Destination;
use super::error::{ErrorKind, Result};

const LOG_TAG: &str = "http_tunnel";

fn proxy_error<R: Into<String>>(status: Option<u16>, reason: R) -> ErrorKind {
    ErrorKind::Proxy {
        status,
        reason: reason.into(),
    }
}

/// Asks the proxy for a raw relay to `target` with CONNECT, then runs TLS to
/// `target` over the same socket.
///
/// On any failure the connection is left non-reusable.
pub async fn tunnel(
    conn: &mut Connection,
    target: &Destination,
    proxy_authorization: Option<&str>,
    tls: &Arc<rustls::ClientConfig>,
) -> Result<()> {
    let authority = target.authority();

    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority).as_bytes());
    if let Some(auth) = proxy_authorization {
        buf.put_slice(b"Proxy-Authorization: ");
        buf.put_slice(auth.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");

    platform_log(
        LOG_TAG,
        format!("{:?} CONNECT {}", conn, authority),
    );

    let r = negotiate(conn, &buf).await;
    if let Err(e) = r {
        conn.mark_broken();
        return Err(e);
    }

    conn.set_tunneled();

    if let Err(e) = conn.upgrade_tls(tls, target).await {
        conn.mark_broken();
        return Err(e);
    }

    Ok(())
}

async fn negotiate(conn: &mut Connection, request: &[u8]) -> Result<()> {
    conn.write_chunk(request).await?;

    let head = loop {
        let head = match conn.read_until_headers_complete().await {
            Ok(head) => head,
            Err(ErrorKind::Protocol(reason)) => return Err(proxy_error(None, reason)),
            Err(e) => return Err(e),
        };

        if head.status_code >= 200 || head.status_code == 101 {
            break head;
        }
    };

    if (200..300).contains(&head.status_code) {
        platform_log(
            LOG_TAG,
            format!("tunnel established with {}", head.status_code),
        );
        Ok(())
    } else {
        platform_warn(
            LOG_TAG,
            format!(
                "proxy refused tunnel: {} {}",
                head.status_code, head.reason_phrase
            ),
        );
        Err(proxy_error(Some(head.status_code), head.reason_phrase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::http::config::{Timeouts, TlsConfig};
    use crate::http::destination::{Route, Scheme};

    #[tokio::test]
    async fn refused_tunnel_reports_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let proxy = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let tls = TlsConfig::default().build().unwrap();
        let target = Destination::new(Scheme::Https, "example.com", 443);
        let route = Route::Tunnel {
            proxy: Destination::new(Scheme::Http, "127.0.0.1", port),
            target: target.clone(),
        };

        let mut conn = Connection::open(&route, &tls, Timeouts::both(Duration::from_secs(5)))
            .await
            .unwrap();
        let r = tunnel(&mut conn, &target, Some("Basic dXNlcjpwdw=="), &tls).await;

        assert_eq!(
            r,
            Err(ErrorKind::Proxy {
                status: Some(407),
                reason: String::from("Proxy Authentication Required"),
            })
        );
        assert!(!conn.is_reusable());
        assert!(!conn.is_tunneled());

        let sent = proxy.await.unwrap();
        assert!(sent.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(sent.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
    }
}
