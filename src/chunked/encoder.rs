/// The frame that terminates a chunked body (no trailers).
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frame `data` as a single chunk.
///
/// Empty input produces an empty frame: a zero-length chunk would end the
/// body, which only [`LAST_CHUNK`] may do.
pub(crate) fn encode_chunk(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let start = format!("{:X}\r\n", data.len());
    let mut frame = Vec::with_capacity(start.len() + data.len() + 2);
    frame.extend_from_slice(start.as_bytes());
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\r\n");
    frame
}
