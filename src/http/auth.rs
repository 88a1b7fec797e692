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

extern crate base64;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::internet::header::{self, Header};

use super::request::Request;
use super::response::Response;

/// Adds credentials to outgoing requests.
pub trait AuthProvider: Send + Sync {
    /// Called once per logical request before it is first sent.
    fn authorize(&self, request: &mut Request);

    /// Headers to retry a 401 with, `None` gives the 401 back to the caller.
    /// A request is retried at most once.
    fn retry_unauthorized(&self, request: &Request, response: &Response) -> Option<Vec<Header>>;
}

/// `Basic` credentials value for an `Authorization` style header.
pub fn basic_authorization(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", username, password))
    )
}

pub struct BasicAuth {
    value: String,
    preemptive: bool,
}

impl BasicAuth {
    /// Sends the credentials with every request.
    pub fn new(username: &str, password: &str) -> BasicAuth {
        BasicAuth {
            value: basic_authorization(username, password),
            preemptive: true,
        }
    }

    /// Sends the credentials only in answer to a `Basic` challenge.
    pub fn on_challenge(username: &str, password: &str) -> BasicAuth {
        BasicAuth {
            value: basic_authorization(username, password),
            preemptive: false,
        }
    }
}

impl AuthProvider for BasicAuth {
    fn authorize(&self, request: &mut Request) {
        if self.preemptive && !header::contains(&request.headers, b"Authorization") {
            request
                .headers
                .push(Header::new("Authorization", self.value.clone()));
        }
    }

    fn retry_unauthorized(&self, request: &Request, response: &Response) -> Option<Vec<Header>> {
        if response.status != 401 {
            return None;
        }

        if header::get_str(&request.headers, b"Authorization") == Some(self.value.as_str()) {
            return None;
        }

        let challenged = header::HeaderSearch::new(&response.headers, b"WWW-Authenticate", true)
            .any(|h| {
                let value = header::trim(h.get_value());
                value.len() >= 5 && value[..5].eq_ignore_ascii_case(b"basic")
            });

        if challenged {
            Some(vec![Header::new("Authorization", self.value.clone())])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_value() {
        assert_eq!(
            basic_authorization("Aladdin", "open sesame"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn preemptive_keeps_explicit_header() {
        let auth = BasicAuth::new("u", "p");

        let mut request = Request::get("http://example.com/").unwrap();
        auth.authorize(&mut request);
        assert_eq!(request.header("Authorization"), Some("Basic dTpw"));

        let mut request = Request::get("http://example.com/")
            .unwrap()
            .with_header("Authorization", "Bearer token");
        auth.authorize(&mut request);
        assert_eq!(request.header("Authorization"), Some("Bearer token"));
        assert_eq!(request.headers.len(), 1);
    }
}
