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

extern crate async_compression;
extern crate bytes;
extern crate futures;

use std::marker::Unpin;

use async_compression::futures::bufread::BrotliDecoder;
use async_compression::futures::bufread::DeflateDecoder;
use async_compression::futures::bufread::GzipDecoder;

use bytes::Bytes;

use futures::io::{AsyncBufRead, AsyncRead, AsyncReadExt};
use futures::stream::TryStreamExt;

use crate::internet::header::{self, Header, HeaderSearch};

use super::body::BodyStream;

const DECODE_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Brotli,
    Deflate,
    Gzip,
}

pub const ACCEPT_ENCODING: &str = "gzip, deflate, br";

/// Codings listed in `Content-Encoding`, in the order they were applied.
///
/// `None` when there is nothing to undo, or when one of them is not
/// supported and the body has to be passed through untouched.
pub fn content_encodings(headers: &[Header]) -> Option<Vec<Encoding>> {
    let mut encodings = Vec::new();

    for h in HeaderSearch::new(headers, b"Content-Encoding", true) {
        for value in h.get_value().split(|c| *c == b',') {
            let value = header::trim(value);
            if value.eq_ignore_ascii_case(b"gzip") || value.eq_ignore_ascii_case(b"x-gzip") {
                encodings.push(Encoding::Gzip);
            } else if value.eq_ignore_ascii_case(b"deflate") {
                encodings.push(Encoding::Deflate);
            } else if value.eq_ignore_ascii_case(b"br") {
                encodings.push(Encoding::Brotli);
            } else if !value.is_empty() && !value.eq_ignore_ascii_case(b"identity") {
                return None;
            }
        }
    }

    if encodings.is_empty() {
        None
    } else {
        Some(encodings)
    }
}

fn unfold<R>(decoder: R) -> BodyStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Box::pin(futures::stream::try_unfold(
        decoder,
        |mut decoder| async move {
            let mut chunk = vec![0; DECODE_CHUNK_SIZE];
            let len = decoder.read(&mut chunk).await?;
            if len == 0 {
                Ok(None)
            } else {
                chunk.truncate(len);
                Ok(Some((Bytes::from(chunk), decoder)))
            }
        },
    ))
}

/// Undoes a stack of content codings over a lazily read body.
pub struct Decompressor {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
}

impl Decompressor {
    pub fn new(encodings: &[Encoding], source: BodyStream) -> Decompressor {
        let mut reader: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(source.into_async_read());

        for encoding in encodings.iter().rev() {
            let decoded = match encoding {
                Encoding::Brotli => unfold(BrotliDecoder::new(reader)),
                Encoding::Deflate => unfold(DeflateDecoder::new(reader)),
                Encoding::Gzip => unfold(GzipDecoder::new(reader)),
            };
            reader = Box::new(decoded.into_async_read());
        }

        Decompressor { reader }
    }

    pub fn into_stream(self) -> BodyStream {
        unfold(self.reader)
    }
}
