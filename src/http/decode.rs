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
extern crate httparse;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use httparse::{Response as ResponseParser, Status};

use crate::internet::header::Header;
use crate::util::log::platform_log;

use super::error::{ErrorKind, Result};

const LOG_TAG: &str = "http_decode";

pub const MAX_LINE_LENGTH: usize = 8 * 1024;

pub const MAX_HEAD_SIZE: usize = 64 * 1024;

pub const MAX_HEADERS: usize = 100;

const MAX_TRAILERS: usize = 32;

/// Status line and headers of a response, the body is framed separately.
pub struct ResponseHead {
    pub version: u8,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<Header>,
}

pub enum HeaderPartDecodeStatus {
    Success(ResponseHead, usize),
    Again,
}

/// Any single line, finished or still arriving, must fit `MAX_LINE_LENGTH`.
fn check_line_lengths(data: &[u8]) -> Result<()> {
    for line in data.split(|c| *c == b'\n') {
        if line.len() > MAX_LINE_LENGTH {
            return Err(ErrorKind::protocol("header line too long"));
        }
    }
    Ok(())
}

pub fn decode_head(data: &[u8]) -> Result<HeaderPartDecodeStatus> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parser = ResponseParser::new(&mut headers);

    match parser.parse(data) {
        Ok(Status::Partial) => {
            check_line_lengths(data)?;
            if data.len() > MAX_HEAD_SIZE {
                return Err(ErrorKind::protocol("response head too large"));
            }
            Ok(HeaderPartDecodeStatus::Again)
        }

        Ok(Status::Complete(size)) => {
            check_line_lengths(&data[..size])?;

            if let (Some(version), Some(code)) = (parser.version, parser.code) {
                let reason = parser.reason.unwrap_or("");
                platform_log(LOG_TAG, format!("HTTP/1.{} {} {}", version, code, reason));

                let mut headers = Vec::with_capacity(parser.headers.len());
                for h in &*parser.headers {
                    headers.push(Header::new(String::from(h.name), h.value.to_vec()));
                }

                Ok(HeaderPartDecodeStatus::Success(
                    ResponseHead {
                        version,
                        status_code: code,
                        reason_phrase: String::from(reason),
                        headers,
                    },
                    size,
                ))
            } else {
                Err(ErrorKind::protocol("incomplete status line"))
            }
        }

        Err(httparse::Error::TooManyHeaders) => Err(ErrorKind::protocol("too many headers")),

        Err(e) => Err(ErrorKind::Protocol(format!("malformed response head: {}", e))),
    }
}

enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

pub enum ChunkDecodeResult {
    Part(Bytes),
    Again,
    EOF(Vec<Header>),
}

/// Incremental `Transfer-Encoding: chunked` decoder.
///
/// Payload is handed out as soon as it is buffered, a chunk never has to be
/// held in memory whole.
pub struct ChunkDecoder {
    state: ChunkState,
}

impl ChunkDecoder {
    pub fn new() -> ChunkDecoder {
        ChunkDecoder {
            state: ChunkState::Size,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<ChunkDecodeResult> {
        loop {
            match self.state {
                ChunkState::Size => match httparse::parse_chunk_size(buf) {
                    Ok(Status::Complete((index, size))) => {
                        buf.advance(index);
                        if size == 0 {
                            platform_log(LOG_TAG, "on last chunk");
                            self.state = ChunkState::Trailers;
                        } else {
                            self.state = ChunkState::Data(size);
                        }
                    }

                    Ok(Status::Partial) => {
                        if buf.len() > MAX_LINE_LENGTH {
                            return Err(ErrorKind::protocol("chunk size line too long"));
                        }
                        return Ok(ChunkDecodeResult::Again);
                    }

                    Err(_) => return Err(ErrorKind::protocol("invalid chunk size")),
                },

                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(ChunkDecodeResult::Again);
                    }

                    let take = std::cmp::min(remaining, buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    if remaining == take as u64 {
                        self.state = ChunkState::DataEnd;
                    } else {
                        self.state = ChunkState::Data(remaining - take as u64);
                    }

                    return Ok(ChunkDecodeResult::Part(data));
                }

                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(ChunkDecodeResult::Again);
                    }

                    if &buf[..2] == b"\r\n" {
                        buf.advance(2);
                        self.state = ChunkState::Size;
                    } else {
                        return Err(ErrorKind::protocol("missing CRLF after chunk data"));
                    }
                }

                ChunkState::Trailers => {
                    if buf.len() < 2 {
                        return Ok(ChunkDecodeResult::Again);
                    }

                    if &buf[..2] == b"\r\n" {
                        buf.advance(2);
                        self.state = ChunkState::Done;
                        return Ok(ChunkDecodeResult::EOF(Vec::new()));
                    }

                    let mut headers = [httparse::EMPTY_HEADER; MAX_TRAILERS];
                    match httparse::parse_headers(buf, &mut headers) {
                        Ok(Status::Complete((size, parsed))) => {
                            let trailers: Vec<Header> = parsed
                                .iter()
                                .map(|h| Header::new(String::from(h.name), h.value.to_vec()))
                                .collect();
                            buf.advance(size);
                            self.state = ChunkState::Done;
                            return Ok(ChunkDecodeResult::EOF(trailers));
                        }

                        Ok(Status::Partial) => {
                            check_line_lengths(buf)?;
                            if buf.len() > MAX_HEAD_SIZE {
                                return Err(ErrorKind::protocol("trailers too large"));
                            }
                            return Ok(ChunkDecodeResult::Again);
                        }

                        Err(e) => {
                            return Err(ErrorKind::Protocol(format!("malformed trailers: {}", e)));
                        }
                    }
                }

                ChunkState::Done => return Ok(ChunkDecodeResult::EOF(Vec::new())),
            }
        }
    }
}

/// Frames one chunk, empty input writes nothing since a zero size ends the body.
pub fn encode_chunk(data: &[u8], buf: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    buf.put_slice(format!("{:X}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

pub fn encode_last_chunk(trailers: &[Header], buf: &mut BytesMut) {
    buf.put_slice(b"0\r\n");
    for trailer in trailers {
        trailer.encode(buf);
    }
    buf.put_slice(b"\r\n");
}
