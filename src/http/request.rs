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
use std::str::FromStr;

use url::{Position, Url};

use crate::internet::header::{self, Header};

use super::body::Body;
use super::destination::Route;
use super::error::{ErrorKind, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Trace,
    Connect,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }

    /// Methods whose empty body is still announced with `Content-Length: 0`.
    pub fn expects_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl FromStr for Method {
    type Err = ErrorKind;

    fn from_str(s: &str) -> Result<Method> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "CONNECT" => Ok(Method::Connect),
            _ => Err(ErrorKind::protocol(format!("unsupported method {}", s))),
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Request {
    pub method: Method,
    pub url: Url,
    /// In order, duplicates kept.
    pub headers: Vec<Header>,
    pub body: Body,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Request {
        Request {
            method,
            url,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn parse(method: Method, url: &str) -> Result<Request> {
        match Url::parse(url) {
            Ok(url) => Ok(Request::new(method, url)),
            Err(e) => Err(ErrorKind::InvalidUrl(format!("{}: {}", url, e))),
        }
    }

    pub fn get(url: &str) -> Result<Request> {
        Request::parse(Method::Get, url)
    }

    pub fn post(url: &str) -> Result<Request> {
        Request::parse(Method::Post, url)
    }

    pub fn with_header<N, V>(mut self, name: N, value: V) -> Request
    where
        N: AsRef<[u8]> + Send + Sync + 'static,
        V: AsRef<[u8]> + Send + Sync + 'static,
    {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn with_body<B: Into<Body>>(mut self, body: B) -> Request {
        self.body = body.into();
        self
    }

    pub fn with_form<K, V>(mut self, pairs: &[(K, V)]) -> Request
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.body = Body::form(pairs);
        header::set(
            &mut self.headers,
            "Content-Type",
            "application/x-www-form-urlencoded",
        );
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header::get_str(&self.headers, name.as_bytes())
    }

    /// `None` when the body is a stream that cannot be replayed.
    pub fn try_clone(&self) -> Option<Request> {
        Some(Request {
            method: self.method,
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
        })
    }

    /// Origin form, or absolute form when forwarded through a proxy.
    pub fn request_target(&self, route: &Route) -> String {
        if route.is_forward() {
            let mut url = self.url.clone();
            let _ = url.set_username("");
            let _ = url.set_password(None);
            String::from(&url[..Position::AfterQuery])
        } else {
            String::from(&self.url[Position::BeforePath..Position::AfterQuery])
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({:?})", self.method, self.url, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::http::destination::Destination;

    #[test]
    fn origin_and_absolute_targets() {
        let req = Request::get("http://user:pw@example.com:8080/a/b?x=1#frag").unwrap();
        let dst = Destination::from_url(&req.url).unwrap();

        assert_eq!(req.request_target(&Route::Direct(dst.clone())), "/a/b?x=1");
        assert_eq!(
            req.request_target(&Route::Forward(dst)),
            "http://example.com:8080/a/b?x=1"
        );
    }

    #[test]
    fn method_names() {
        assert_eq!("patch".parse::<Method>().unwrap(), Method::Patch);
        assert!("BREW".parse::<Method>().is_err());
        assert!(Method::Put.expects_body());
        assert!(!Method::Get.expects_body());
    }
}
