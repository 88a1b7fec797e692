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
extern crate url;

use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::Bytes;

use futures::stream::Stream;

pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Request payload.
///
/// `Stream` bodies are pulled lazily while sending and can be sent only once,
/// `length` decides between `Content-Length` and chunked framing.
pub enum Body {
    Empty,
    Bytes(Bytes),
    Stream {
        stream: BodyStream,
        length: Option<u64>,
    },
}

impl Body {
    pub fn empty() -> Body {
        Body::Empty
    }

    pub fn wrap_stream<S>(stream: S, length: Option<u64>) -> Body
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Body::Stream {
            stream: Box::pin(stream),
            length,
        }
    }

    /// `application/x-www-form-urlencoded` payload of `pairs`.
    pub fn form<K, V>(pairs: &[(K, V)]) -> Body
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in pairs {
            serializer.append_pair(k.as_ref(), v.as_ref());
        }
        Body::Bytes(Bytes::from(serializer.finish()))
    }

    pub fn content_length(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content_length() == Some(0)
    }

    /// Whether the same payload can be sent again, for redirects and auth retries.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Body::Stream { .. })
    }

    pub fn try_clone(&self) -> Option<Body> {
        match self {
            Body::Empty => Some(Body::Empty),
            Body::Bytes(b) => Some(Body::Bytes(b.clone())),
            Body::Stream { .. } => None,
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::Empty
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Body {
        if b.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(b)
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Body {
        Body::from(Bytes::from(v))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(s: &'static [u8]) -> Body {
        Body::from(Bytes::from_static(s))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Empty"),
            Body::Bytes(b) => write!(f, "Bytes({})", b.len()),
            Body::Stream { length, .. } => write!(f, "Stream({:?})", length),
        }
    }
}
