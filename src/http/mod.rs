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
extern crate url;

pub mod auth;
pub mod body;
pub mod config;
pub mod connection;
pub mod cookie;
pub mod decode;
pub mod decompress;
pub mod destination;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod proxy;
pub mod redirect;
pub mod request;
pub mod response;
pub mod tunnel;

use std::sync::Arc;

use url::Url;

use crate::internet::header::{self, Header};
use crate::util::log::platform_log;

pub use auth::{AuthProvider, BasicAuth};
pub use body::Body;
pub use config::{ClientConfig, PoolConfig, Timeouts, TlsConfig};
pub use self::cookie::{CookieStore, Jar};
pub use destination::{Destination, Route, Scheme};
pub use error::{ErrorKind, Result, TimeoutPhase};
pub use pool::{ConnectionPool, PooledConnection};
pub use proxy::Proxies;
pub use request::{Method, Request};
pub use response::Response;

use decompress::ACCEPT_ENCODING;
use pipeline::{prepare_headers, Outgoing, Pipeline};

const LOG_TAG: &str = "http_client";

/// Most of a redirect or 401 body read to keep its connection.
const DRAIN_LIMIT: usize = 64 * 1024;

/// HTTP/1.1 client over a shared connection pool.
///
/// Cloning is cheap, clones share the pool, cookie store and auth provider.
#[derive(Clone)]
pub struct HttpClient {
    config: Arc<ClientConfig>,
    tls: Arc<rustls::ClientConfig>,
    pool: ConnectionPool,
    cookie_store: Option<Arc<dyn CookieStore>>,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Result<HttpClient> {
        let tls = config.tls.build()?;
        let pool = ConnectionPool::new(config.pool.clone(), Arc::clone(&tls), config.timeouts);

        platform_log(LOG_TAG, format!("client created with {:?}", config));

        Ok(HttpClient {
            config: Arc::new(config),
            tls,
            pool,
            cookie_store: None,
            auth: None,
        })
    }

    pub fn with_cookie_store(mut self, cookie_store: Arc<dyn CookieStore>) -> HttpClient {
        self.cookie_store = Some(cookie_store);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> HttpClient {
        self.auth = Some(auth);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.execute(Request::get(url)?).await
    }

    pub async fn request(&self, method: Method, url: &str) -> Result<Response> {
        self.execute(Request::parse(method, url)?).await
    }

    /// Sends `request`, answering one 401 challenge and following redirects.
    pub async fn execute(&self, mut request: Request) -> Result<Response> {
        if let Some(auth) = &self.auth {
            auth.authorize(&mut request);
        }

        let mut history: Vec<Url> = Vec::new();
        let mut auth_retried = false;

        loop {
            let (attempt, consumed) = match request.try_clone() {
                Some(attempt) => (attempt, false),
                None => (
                    Request {
                        method: request.method,
                        url: request.url.clone(),
                        headers: request.headers.clone(),
                        body: std::mem::take(&mut request.body),
                    },
                    true,
                ),
            };

            let mut response = self.send_once(attempt).await?;

            if response.status == 401 && !auth_retried && !consumed {
                let retry = self
                    .auth
                    .as_ref()
                    .and_then(|auth| auth.retry_unauthorized(&request, &response));

                if let Some(headers) = retry {
                    platform_log(LOG_TAG, format!("retrying {} with credentials", request.url));
                    auth_retried = true;
                    response.drain(DRAIN_LIMIT).await;
                    for h in headers {
                        header::remove(&mut request.headers, h.get_name());
                        request.headers.push(h);
                    }
                    continue;
                }
            }

            if self.config.max_redirects == 0 || !response.is_redirect() {
                response.history = history;
                return Ok(response);
            }

            let next = match redirect::next_request(&request, consumed, &response)? {
                Some(next) => next,
                None => {
                    response.history = history;
                    return Ok(response);
                }
            };

            if history.len() >= self.config.max_redirects {
                response.close();
                return Err(ErrorKind::TooManyRedirects {
                    max: self.config.max_redirects,
                    history,
                });
            }

            platform_log(
                LOG_TAG,
                format!("{} {} -> {} {}", response.status, response.url, next.method, next.url),
            );

            response.drain(DRAIN_LIMIT).await;
            history.push(response.url.clone());
            request = next;
        }
    }

    async fn send_once(&self, request: Request) -> Result<Response> {
        let (route, proxy_authorization) = self.config.proxies.resolve(&request.url)?;
        let dst = Destination::from_url(&request.url)?;

        let mut extra = Vec::new();

        if self.config.decompress && !header::contains(&request.headers, b"Accept-Encoding") {
            extra.push(Header::new("Accept-Encoding", ACCEPT_ENCODING));
        }

        if let Some(store) = &self.cookie_store {
            if !header::contains(&request.headers, b"Cookie") {
                if let Some(cookies) = store.cookies(&request.url) {
                    extra.push(Header::new("Cookie", cookies));
                }
            }
        }

        if route.is_forward() {
            if let Some(authorization) = &proxy_authorization {
                extra.push(Header::new("Proxy-Authorization", authorization.clone()));
            }
        }

        let (headers, _) =
            prepare_headers(request.method, &dst, &request.headers, &request.body, extra)?;
        let target = request.request_target(&route);

        let outgoing = Outgoing {
            method: request.method,
            url: &request.url,
            route: &route,
            target,
            headers,
            body: request.body,
            proxy_authorization: proxy_authorization.as_deref(),
            decode: self.config.decompress,
        };

        let mut pipeline = Pipeline::new(&self.pool, &self.tls);
        let response = pipeline.run(outgoing).await?;

        if let Some(store) = &self.cookie_store {
            store.set_cookies(&response.url, &response.headers);
        }

        platform_log(LOG_TAG, format!("{:?}", response));

        Ok(response)
    }

    /// Closes idle connections and refuses new requests, `force` also
    /// closes connections still in use.
    pub fn shutdown(&self, force: bool) {
        self.pool.shutdown(force);
    }
}
