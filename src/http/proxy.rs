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

use std::collections::HashMap;
use std::fmt;

use url::Url;

use super::auth::basic_authorization;
use super::destination::{Destination, Route};
use super::error::{ErrorKind, Result};

/// Proxy URLs keyed by `"{scheme}://{host}"`, `"{scheme}"`, `"all://{host}"`
/// or `"all"`, looked up in that order.
#[derive(Clone, Default)]
pub struct Proxies {
    proxies: HashMap<String, Url>,
}

impl Proxies {
    pub fn new() -> Proxies {
        Proxies {
            proxies: HashMap::new(),
        }
    }

    /// Only plain `http://` proxies are supported.
    pub fn insert(&mut self, key: &str, proxy: &str) -> Result<()> {
        let url = match Url::parse(proxy) {
            Ok(url) => url,
            Err(e) => return Err(ErrorKind::InvalidUrl(format!("proxy {}: {}", proxy, e))),
        };

        if url.scheme() != "http" {
            return Err(ErrorKind::InvalidUrl(format!(
                "unsupported proxy scheme {}",
                url.scheme()
            )));
        }

        if url.host_str().is_none() {
            return Err(ErrorKind::InvalidUrl(format!("proxy {} has no host", proxy)));
        }

        self.proxies.insert(key.to_ascii_lowercase(), url);
        Ok(())
    }

    pub fn with(mut self, key: &str, proxy: &str) -> Result<Proxies> {
        self.insert(key, proxy)?;
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn select(&self, url: &Url) -> Option<&Url> {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("").to_ascii_lowercase();

        let keys = [
            format!("{}://{}", scheme, host),
            String::from(scheme),
            format!("all://{}", host),
            String::from("all"),
        ];

        keys.iter().find_map(|key| self.proxies.get(key))
    }

    /// Route to `url` and the `Proxy-Authorization` value the proxy wants.
    pub fn resolve(&self, url: &Url) -> Result<(Route, Option<String>)> {
        let dst = Destination::from_url(url)?;

        match self.select(url) {
            Some(proxy) => {
                let proxy_dst = Destination::from_url(proxy)?;
                let authorization = if proxy.username().is_empty() {
                    None
                } else {
                    Some(basic_authorization(
                        proxy.username(),
                        proxy.password().unwrap_or(""),
                    ))
                };

                let route = if dst.is_tls() {
                    Route::Tunnel {
                        proxy: proxy_dst,
                        target: dst,
                    }
                } else {
                    Route::Forward(proxy_dst)
                };

                Ok((route, authorization))
            }

            None => Ok((Route::Direct(dst), None)),
        }
    }
}

impl fmt::Debug for Proxies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.proxies.keys().collect();
        keys.sort();
        write!(f, "Proxies({:?})", keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn selection_order() {
        let proxies = Proxies::new()
            .with("all", "http://fallback:3128")
            .unwrap()
            .with("https", "http://secure:3128")
            .unwrap()
            .with("http://special.example", "http://special:8080")
            .unwrap();

        assert_eq!(
            proxies.select(&url("http://special.example/x")).map(|u| u.as_str()),
            Some("http://special:8080/")
        );
        assert_eq!(
            proxies.select(&url("https://other.example/")).map(|u| u.as_str()),
            Some("http://secure:3128/")
        );
        assert_eq!(
            proxies.select(&url("http://other.example/")).map(|u| u.as_str()),
            Some("http://fallback:3128/")
        );
    }

    #[test]
    fn routes_and_credentials() {
        let proxies = Proxies::new().with("all", "http://user:pw@proxy:3128").unwrap();

        let (route, auth) = proxies.resolve(&url("https://example.com/")).unwrap();
        assert!(route.needs_tunnel());
        assert_eq!(auth.as_deref(), Some("Basic dXNlcjpwdw=="));

        let (route, _) = proxies.resolve(&url("http://example.com/")).unwrap();
        assert!(route.is_forward());
        assert_eq!(route.peer().host, "proxy");
        assert_eq!(route.peer().port, 3128);

        let (route, auth) = Proxies::new().resolve(&url("http://example.com/")).unwrap();
        assert!(matches!(route, Route::Direct(_)));
        assert!(auth.is_none());
    }

    #[test]
    fn socks_is_rejected() {
        assert!(matches!(
            Proxies::new().insert("all", "socks5://proxy:1080"),
            Err(ErrorKind::InvalidUrl(_))
        ));
    }
}
