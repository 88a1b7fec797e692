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

extern crate thiserror;
extern crate url;

use std::fmt;
use std::io;

use url::Url;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Write,
    Read,
}

impl fmt::Debug for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Connect => {
                write!(f, "connect")
            }

            TimeoutPhase::Write => {
                write!(f, "write")
            }

            TimeoutPhase::Read => {
                write!(f, "read")
            }
        }
    }
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("connect failed: {0:?}")]
    Connect(io::ErrorKind),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("proxy error: {status:?} {reason}")]
    Proxy { status: Option<u16>, reason: String },

    #[error("write failed: {0:?}")]
    Write(io::ErrorKind),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0} timeout elapsed")]
    Timeout(TimeoutPhase),

    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("connection pool closed")]
    PoolClosed,

    /// `history` holds the URLs that were followed, oldest first.
    #[error("too many redirects ({max})")]
    TooManyRedirects { max: usize, history: Vec<Url> },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("request body error: {0}")]
    Body(String),

    #[error("error decoding response body: {0}")]
    Decode(String),

    #[error("io error: {0:?}")]
    Io(io::ErrorKind),
}

impl ErrorKind {
    pub fn protocol<M: Into<String>>(message: M) -> ErrorKind {
        ErrorKind::Protocol(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Timeout(_) | ErrorKind::PoolTimeout)
    }

    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            ErrorKind::Connect(_) | ErrorKind::Timeout(TimeoutPhase::Connect)
        )
    }

    /// Read side failure while a response is streaming in.
    pub(crate) fn from_read(e: io::Error) -> ErrorKind {
        match e.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout(TimeoutPhase::Read),
            io::ErrorKind::InvalidData => ErrorKind::Tls(e.to_string()),
            kind => ErrorKind::Io(kind),
        }
    }
}

pub type Result<T> = std::result::Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_phase_is_reported() {
        let e = ErrorKind::Timeout(TimeoutPhase::Connect);
        assert!(e.is_timeout());
        assert!(e.is_connect());
        assert_eq!(e.to_string(), "connect timeout elapsed");

        let e = ErrorKind::Timeout(TimeoutPhase::Read);
        assert!(!e.is_connect());
        assert_eq!(e.to_string(), "read timeout elapsed");
    }
}
