use std::ops::Range;

use crate::{Error, Result};

const MAX_CHUNK_SIZE: u64 = 0x0FFF_FFFF_FFFF_FFFF;

/// The maximum number of trailer fields accepted after the last chunk.
const MAX_TRAILERS: usize = 16;

/// Decodes a chunked body according to
/// https://tools.ietf.org/html/rfc7230#section-4.1
///
/// The decoder never owns bytes: it is handed the caller's buffer, reports how
/// much of it was consumed and which range (if any) is body data.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: State,
}

/// One step of decoding progress.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// Body data, as a range into the buffer passed to `decode`.
    Data(Range<usize>),
    /// The last chunk and any trailers were consumed.
    End,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        ChunkedDecoder {
            state: State::Size {
                size: 0,
                digits: 0,
                inner: ChunkSizeState::ChunkSize,
            },
        }
    }

    /// Decode as much of `buf` as possible.
    ///
    /// Returns the number of bytes consumed from the front of `buf`. `None`
    /// means more input is needed; the unconsumed tail must be presented
    /// again, followed by new bytes.
    pub(crate) fn decode(&mut self, buf: &[u8]) -> Result<(usize, Option<Decoded>)> {
        let mut read = 0;
        while read < buf.len() {
            match &mut self.state {
                State::Size {
                    size,
                    digits,
                    inner,
                } => {
                    let (amt, done) = read_chunk_size(&buf[read..], size, digits, inner)?;
                    read += amt;
                    if done {
                        let size = *size;
                        self.state = if size > 0 {
                            State::Data { remaining: size }
                        } else {
                            State::MaybeTrailer { new_line: false }
                        };
                    }
                }
                State::Data { remaining } => {
                    let amt = (*remaining).min((buf.len() - read) as u64) as usize;
                    *remaining -= amt as u64;
                    if *remaining == 0 {
                        self.state = State::AfterChunk { new_line: false };
                    }
                    return Ok((read + amt, Some(Decoded::Data(read..read + amt))));
                }
                State::AfterChunk { new_line } => match (*new_line, buf[read]) {
                    (false, b'\r') => {
                        *new_line = true;
                        read += 1;
                    }
                    (true, b'\n') => {
                        self.state = State::Size {
                            size: 0,
                            digits: 0,
                            inner: ChunkSizeState::ChunkSize,
                        };
                        read += 1;
                    }
                    _ => return Err(Error::malformed("bad chunked encoding")),
                },
                State::MaybeTrailer { new_line } => match (*new_line, buf[read]) {
                    (false, b'\r') => {
                        *new_line = true;
                        read += 1;
                    }
                    (true, b'\n') => {
                        self.state = State::Done;
                        return Ok((read + 1, Some(Decoded::End)));
                    }
                    (false, _) => self.state = State::Trailer,
                    (true, _) => return Err(Error::malformed("bad chunked encoding")),
                },
                State::Trailer => {
                    let mut headers = [httparse::EMPTY_HEADER; MAX_TRAILERS];
                    return match httparse::parse_headers(&buf[read..], &mut headers)? {
                        httparse::Status::Complete((amt, trailers)) => {
                            log::trace!("discarding {} trailer fields", trailers.len());
                            self.state = State::Done;
                            Ok((read + amt, Some(Decoded::End)))
                        }
                        httparse::Status::Partial => Ok((read, None)),
                    };
                }
                State::Done => return Ok((read, Some(Decoded::End))),
            }
        }
        Ok((read, None))
    }
}

fn read_chunk_size(
    buf: &[u8],
    size: &mut u64,
    digits: &mut u8,
    state: &mut ChunkSizeState,
) -> Result<(usize, bool)> {
    for (offset, c) in buf.iter().copied().enumerate() {
        match *state {
            ChunkSizeState::ChunkSize => match c {
                b'0'..=b'9' => *size = (*size << 4) + (c - b'0') as u64,
                b'a'..=b'f' => *size = (*size << 4) + (c + 10 - b'a') as u64,
                b'A'..=b'F' => *size = (*size << 4) + (c + 10 - b'A') as u64,
                b';' if *digits > 0 => *state = ChunkSizeState::Extension,
                b'\r' if *digits > 0 => *state = ChunkSizeState::NewLine,
                _ => return Err(httparse::InvalidChunkSize.into()),
            },
            // Extensions are skipped, not interpreted.
            ChunkSizeState::Extension => match c {
                b'\r' => *state = ChunkSizeState::NewLine,
                b'\n' => return Err(httparse::InvalidChunkSize.into()),
                _ => {}
            },
            ChunkSizeState::NewLine => match c {
                b'\n' => return Ok((offset + 1, true)),
                _ => return Err(httparse::InvalidChunkSize.into()),
            },
        }
        if *state == ChunkSizeState::ChunkSize {
            *digits = digits.saturating_add(1);
        }
        if *size > MAX_CHUNK_SIZE {
            return Err(httparse::InvalidChunkSize.into());
        }
    }
    Ok((buf.len(), false))
}

impl From<httparse::InvalidChunkSize> for Error {
    fn from(_: httparse::InvalidChunkSize) -> Self {
        Error::malformed("bad chunked encoding")
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ChunkSizeState {
    ChunkSize,
    Extension,
    NewLine,
}

// Decoder state
#[derive(Debug)]
enum State {
    // Reading the size line before a chunk
    Size {
        size: u64,
        digits: u8,
        inner: ChunkSizeState,
    },
    // Inside a chunk
    Data { remaining: u64 },
    // Just finished reading the chunk data
    AfterChunk { new_line: bool },
    // Just read the last chunk's size line
    MaybeTrailer { new_line: bool },
    // Waiting for the complete trailer section
    Trailer,
    // We're done
    Done,
}
