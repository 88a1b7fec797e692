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

use std::fmt;
use std::slice::Iter;

use bytes::{BufMut, BytesMut};

pub struct Header {
    name: Box<dyn AsRef<[u8]> + Send + Sync>,
    value: Box<dyn AsRef<[u8]> + Send + Sync>,
}

impl Header {
    pub fn new<N, V>(name: N, value: V) -> Header
    where
        N: AsRef<[u8]> + Send + Sync + 'static,
        V: AsRef<[u8]> + Send + Sync + 'static,
    {
        Header {
            name: Box::new(name),
            value: Box::new(value),
        }
    }

    pub fn get_name(&self) -> &[u8] {
        self.name.as_ref().as_ref()
    }

    pub fn get_value(&self) -> &[u8] {
        self.value.as_ref().as_ref()
    }

    /// Value as text, `None` when the peer sent non UTF-8 bytes.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(self.get_value()).ok()
    }

    pub fn name_is(&self, name: &[u8]) -> bool {
        self.get_name().eq_ignore_ascii_case(name)
    }

    /// Neither name nor value may smuggle a line break onto the wire.
    pub fn is_well_formed(&self) -> bool {
        let name = self.get_name();
        !name.is_empty()
            && name
                .iter()
                .all(|c| c.is_ascii_graphic() && *c != b':')
            && !self
                .get_value()
                .iter()
                .any(|c| *c == b'\r' || *c == b'\n' || *c == 0)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.get_name());
        buf.put_slice(b": ");
        buf.put_slice(self.get_value());
        buf.put_slice(b"\r\n");
    }
}

impl Clone for Header {
    fn clone(&self) -> Self {
        Header {
            name: Box::new(self.name.as_ref().as_ref().to_vec()),
            value: Box::new(self.value.as_ref().as_ref().to_vec()),
        }
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Header) -> bool {
        self.name_is(other.get_name()) && self.get_value() == other.get_value()
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field(
                &String::from_utf8_lossy(self.name.as_ref().as_ref()),
                &String::from_utf8_lossy(self.value.as_ref().as_ref()),
            )
            .finish()
    }
}

pub struct HeaderSearch<'a, 'b> {
    iter: Iter<'a, Header>,
    name: &'b [u8],
    ignore_case: bool,
}

impl<'a, 'b> HeaderSearch<'a, 'b> {
    pub fn new(headers: &'a [Header], name: &'b [u8], ignore_case: bool) -> HeaderSearch<'a, 'b> {
        HeaderSearch {
            iter: headers.iter(),
            name,
            ignore_case,
        }
    }
}

impl<'a, 'b> Iterator for HeaderSearch<'a, '_> {
    type Item = &'a Header;
    fn next(&mut self) -> Option<&'a Header> {
        while let Some(h) = self.iter.next() {
            if self.ignore_case {
                if h.name_is(self.name) {
                    return Some(h);
                }
            } else {
                if h.get_name().eq(self.name) {
                    return Some(h);
                }
            }
        }

        None
    }
}

pub fn search<'a>(headers: &'a [Header], name: &[u8], ignore_case: bool) -> Option<&'a Header> {
    HeaderSearch::new(headers, name, ignore_case).next()
}

/// First value of `name` as text, names compared without case.
pub fn get_str<'a>(headers: &'a [Header], name: &[u8]) -> Option<&'a str> {
    search(headers, name, true).and_then(|h| h.value_str())
}

pub fn contains(headers: &[Header], name: &[u8]) -> bool {
    search(headers, name, true).is_some()
}

/// Removes every occurrence of `name`, keeping the order of the rest.
pub fn remove(headers: &mut Vec<Header>, name: &[u8]) {
    headers.retain(|h| !h.name_is(name));
}

/// Replaces all occurrences of the header with a single new one.
pub fn set<N, V>(headers: &mut Vec<Header>, name: N, value: V)
where
    N: AsRef<[u8]> + Send + Sync + 'static,
    V: AsRef<[u8]> + Send + Sync + 'static,
{
    remove(headers, name.as_ref());
    headers.push(Header::new(name, value));
}

/// True if any comma separated token of any `name` header equals `token`.
pub fn has_token(headers: &[Header], name: &[u8], token: &[u8]) -> bool {
    HeaderSearch::new(headers, name, true).any(|h| {
        h.get_value()
            .split(|c| *c == b',')
            .any(|t| trim(t).eq_ignore_ascii_case(token))
    })
}

pub fn trim(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(s.len());
    let end = s
        .iter()
        .rposition(|c| !c.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &s[start..end]
}

pub fn encode_headers(headers: &[Header], buf: &mut BytesMut) {
    for header in headers {
        header.encode(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_ignores_case_and_keeps_order() {
        let headers = vec![
            Header::new("Set-Cookie", "a=1"),
            Header::new("content-type", "text/plain"),
            Header::new("set-cookie", "b=2"),
        ];

        let values: Vec<&[u8]> = HeaderSearch::new(&headers, b"SET-COOKIE", true)
            .map(|h| h.get_value())
            .collect();
        assert_eq!(values, vec![&b"a=1"[..], &b"b=2"[..]]);

        assert!(search(&headers, b"Content-Type", false).is_none());
        assert_eq!(get_str(&headers, b"Content-Type"), Some("text/plain"));
    }

    #[test]
    fn connection_tokens() {
        let headers = vec![Header::new("Connection", "keep-alive, Close")];
        assert!(has_token(&headers, b"connection", b"close"));
        assert!(!has_token(&headers, b"connection", b"upgrade"));
    }

    #[test]
    fn rejects_header_injection() {
        assert!(Header::new("X-Ok", "value").is_well_formed());
        assert!(!Header::new("X-Bad", "a\r\nInjected: 1").is_well_formed());
        assert!(!Header::new("Bad Name", "v").is_well_formed());
    }

    #[test]
    fn set_replaces_all() {
        let mut headers = vec![Header::new("Host", "a"), Header::new("host", "b")];
        set(&mut headers, "Host", "c");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].get_value(), b"c");
    }
}
