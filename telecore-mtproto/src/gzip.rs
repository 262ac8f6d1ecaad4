//! `gzip_packed` wrapping of message bodies.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::GzEncoder;
use telecore_tl::Serializable;
use telecore_tl::mtproto::GzipPacked;

/// Compress `body` and wrap it in `gzip_packed`.
pub fn pack(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    let packed_data = encoder.finish()?;
    Ok(GzipPacked { packed_data }.to_bytes())
}

/// Decompress the payload of a `gzip_packed`.
///
/// The server uses gzip framing; a bare zlib stream is accepted too.
pub fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    if GzDecoder::new(data).read_to_end(&mut out).is_ok() && !out.is_empty() {
        return Ok(out);
    }
    out.clear();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
