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

use url::Url;

use crate::internet::header;

use super::body::Body;
use super::error::{ErrorKind, Result};
use super::request::{Method, Request};
use super::response::Response;

fn same_origin_host(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

/// Request that follows `response`, or `None` when it should be handed to
/// the caller as is.
///
/// `body_consumed` tells that the body of `previous` was a stream that went
/// out with the last attempt and can not be sent again.
pub fn next_request(
    previous: &Request,
    body_consumed: bool,
    response: &Response,
) -> Result<Option<Request>> {
    let location = match response.header("Location") {
        Some(location) => location.trim(),
        None => return Ok(None),
    };

    let mut url = previous
        .url
        .join(location)
        .map_err(|e| ErrorKind::InvalidUrl(format!("{}: {}", location, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ErrorKind::InvalidUrl(format!(
                "redirect to unsupported scheme {}",
                scheme
            )))
        }
    }

    if url.fragment().is_none() {
        url.set_fragment(previous.url.fragment());
    }

    let (method, keep_body) = match response.status {
        302 | 303 if previous.method != Method::Head => (Method::Get, false),
        301 if previous.method == Method::Post => (Method::Get, false),
        301 | 302 | 303 => (previous.method, false),
        307 | 308 => (previous.method, true),
        _ => return Ok(None),
    };

    let body = if keep_body {
        if body_consumed {
            return Ok(None);
        }
        match previous.body.try_clone() {
            Some(body) => body,
            None => return Ok(None),
        }
    } else {
        Body::Empty
    };

    let mut headers = previous.headers.clone();
    header::remove(&mut headers, b"Host");

    if !keep_body {
        header::remove(&mut headers, b"Content-Length");
        header::remove(&mut headers, b"Content-Type");
        header::remove(&mut headers, b"Transfer-Encoding");
    }

    if !same_origin_host(&previous.url, &url) {
        header::remove(&mut headers, b"Authorization");
        header::remove(&mut headers, b"Cookie");
    }

    Ok(Some(Request {
        method,
        url,
        headers,
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::http::decode::ResponseHead;
    use crate::http::response::ResponseBody;
    use crate::internet::header::Header;

    fn redirect(status: u16, location: &str) -> Response {
        let head = ResponseHead {
            version: 1,
            status_code: status,
            reason_phrase: String::new(),
            headers: vec![Header::new("Location", String::from(location))],
        };
        Response::new(
            head,
            Url::parse("http://example.com/").unwrap(),
            ResponseBody::empty(),
        )
    }

    fn post() -> Request {
        Request::post("http://example.com/form#top")
            .unwrap()
            .with_header("Authorization", "Basic eDp5")
            .with_header("Host", "example.com")
            .with_form(&[("a", "1")])
    }

    #[test]
    fn see_other_becomes_get() {
        let next = next_request(&post(), false, &redirect(303, "/done"))
            .unwrap()
            .unwrap();

        assert_eq!(next.method, Method::Get);
        assert_eq!(next.url.as_str(), "http://example.com/done#top");
        assert!(next.body.is_empty());
        assert_eq!(next.header("Content-Type"), None);
        assert_eq!(next.header("Host"), None);
        assert_eq!(next.header("Authorization"), Some("Basic eDp5"));
    }

    #[test]
    fn temporary_redirect_keeps_method_and_body() {
        let next = next_request(&post(), false, &redirect(307, "/again"))
            .unwrap()
            .unwrap();

        assert_eq!(next.method, Method::Post);
        assert_eq!(next.body.content_length(), Some(3));
        assert_eq!(
            next.header("Content-Type"),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn moved_and_found_drop_the_body() {
        let put = || {
            Request::parse(Method::Put, "http://example.com/item")
                .unwrap()
                .with_header("Content-Type", "text/plain")
                .with_body("payload")
        };

        let next = next_request(&put(), false, &redirect(302, "/next"))
            .unwrap()
            .unwrap();
        assert_eq!(next.method, Method::Get);
        assert!(next.body.is_empty());
        assert_eq!(next.header("Content-Type"), None);

        let next = next_request(&put(), false, &redirect(301, "/next"))
            .unwrap()
            .unwrap();
        assert_eq!(next.method, Method::Put);
        assert!(next.body.is_empty());
        assert_eq!(next.header("Content-Type"), None);

        let head = Request::parse(Method::Head, "http://example.com/").unwrap();
        let next = next_request(&head, false, &redirect(302, "/next"))
            .unwrap()
            .unwrap();
        assert_eq!(next.method, Method::Head);
    }

    #[test]
    fn consumed_stream_is_not_followed() {
        assert!(next_request(&post(), true, &redirect(308, "/again"))
            .unwrap()
            .is_none());
        assert!(next_request(&post(), true, &redirect(302, "/get"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn credentials_stay_on_the_same_host() {
        let req = Request::get("http://example.com/")
            .unwrap()
            .with_header("Authorization", "Basic eDp5")
            .with_header("Cookie", "a=1");
        let next = next_request(&req, false, &redirect(302, "https://other.org/x"))
            .unwrap()
            .unwrap();

        assert_eq!(next.method, Method::Get);
        assert_eq!(next.header("Authorization"), None);
        assert_eq!(next.header("Cookie"), None);
    }

    #[test]
    fn rejects_other_schemes() {
        let req = Request::get("http://example.com/").unwrap();
        assert!(matches!(
            next_request(&req, false, &redirect(301, "ftp://example.com/")),
            Err(ErrorKind::InvalidUrl(_))
        ));
    }
}
