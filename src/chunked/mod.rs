//! Chunked transfer-coding, see
//! https://tools.ietf.org/html/rfc7230#section-4.1

mod decoder;
mod encoder;

pub(crate) use decoder::{ChunkedDecoder, Decoded};
pub(crate) use encoder::{encode_chunk, LAST_CHUNK};
