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

extern crate url;

use std::fmt;

use url::{Host, Url};

use super::error::{ErrorKind, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Debug for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a connection terminates, `(scheme, host, port)`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(scheme: Scheme, host: &str, port: u16) -> Destination {
        Destination {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn from_url(url: &Url) -> Result<Destination> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(ErrorKind::InvalidUrl(format!("unsupported scheme {}", other)));
            }
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) => String::from(domain),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(ErrorKind::InvalidUrl(format!("{} has no host", url)));
            }
        };

        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Destination::new(scheme, &host, port))
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// `host:port` as used by CONNECT, IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the `Host` header, the port is omitted when it is the default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}://{}", self.scheme, self.authority())
    }
}

/// Pool key: a destination plus how it is reached.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Direct(Destination),
    /// Plain http requests forwarded by the proxy, shared across targets.
    Forward(Destination),
    /// https through an HTTP proxy, one CONNECT tunnel per target.
    Tunnel {
        proxy: Destination,
        target: Destination,
    },
}

impl Route {
    /// The endpoint the TCP socket is opened to.
    pub fn peer(&self) -> &Destination {
        match self {
            Route::Direct(dst) => dst,
            Route::Forward(proxy) => proxy,
            Route::Tunnel { proxy, .. } => proxy,
        }
    }

    pub fn needs_tunnel(&self) -> bool {
        matches!(self, Route::Tunnel { .. })
    }

    pub fn is_forward(&self) -> bool {
        matches!(self, Route::Forward(_))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct(dst) => write!(f, "{:?}", dst),
            Route::Forward(proxy) => write!(f, "forward via {:?}", proxy),
            Route::Tunnel { proxy, target } => write!(f, "{:?} via {:?}", target, proxy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_from_url() {
        let url = Url::parse("https://Example.COM/path").unwrap();
        let dst = Destination::from_url(&url).unwrap();
        assert_eq!(dst.scheme, Scheme::Https);
        assert_eq!(dst.host, "example.com");
        assert_eq!(dst.port, 443);
        assert_eq!(dst.host_header(), "example.com");

        let url = Url::parse("http://127.0.0.1:8080/").unwrap();
        let dst = Destination::from_url(&url).unwrap();
        assert_eq!(dst.host_header(), "127.0.0.1:8080");

        let url = Url::parse("http://[::1]:8080/").unwrap();
        let dst = Destination::from_url(&url).unwrap();
        assert_eq!(dst.authority(), "[::1]:8080");
    }

    #[test]
    fn rejects_other_schemes() {
        let url = Url::parse("ftp://example.com/").unwrap();
        assert!(matches!(
            Destination::from_url(&url),
            Err(ErrorKind::InvalidUrl(_))
        ));
    }
}
