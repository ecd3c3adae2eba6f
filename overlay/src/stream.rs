//! Reliable-stream framing for accepted OFFERs: v1's length-prefixed
//! per-key values, v0's single concatenated blob, and `decode_single` for
//! FINDCONTENT's inline raw-content reply (§4.G).

use crate::error::{OverlayError, Result};
use crate::transport::BoxedStream;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

/// Which framing a stream uses, chosen by the negotiated peer version the
/// same way the wire codec chooses the ACCEPT form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEncoding {
    V0,
    V1,
}

impl StreamEncoding {
    pub fn for_version(version: u8) -> Self {
        if version == 0 {
            StreamEncoding::V0
        } else {
            StreamEncoding::V1
        }
    }
}

/// Writes `values` to `stream`, one var-int length prefix per value (v1) or
/// concatenated with no framing at all (v0 — the receiver must already know
/// how many values to expect and, per the unresolved wire ambiguity, v0 is
/// only unambiguous for a single value per connection; see
/// [`recv_offer_contents`]).
pub async fn send_offer_contents(stream: &mut BoxedStream, encoding: StreamEncoding, values: &[Bytes]) -> Result<()> {
    match encoding {
        StreamEncoding::V1 => {
            for value in values {
                write_varint_prefixed(stream, value).await?;
            }
        }
        StreamEncoding::V0 => {
            for value in values {
                stream.write_all(value).await.map_err(|e| OverlayError::LengthMismatch(e.to_string()))?;
            }
        }
    }
    Ok(())
}

/// Reads `count` values back off `stream`.
pub async fn recv_offer_contents(stream: &mut BoxedStream, encoding: StreamEncoding, count: usize) -> Result<Vec<Bytes>> {
    match encoding {
        StreamEncoding::V1 => {
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push(read_varint_prefixed(stream).await?);
            }
            Ok(out)
        }
        StreamEncoding::V0 => {
            if count != 1 {
                return Err(OverlayError::LengthMismatch(
                    "v0 streams infer the boundary from the key count, which is only unambiguous for a single accepted key per connection".into(),
                ));
            }
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.map_err(|e| OverlayError::LengthMismatch(e.to_string()))?;
            Ok(vec![Bytes::from(buf)])
        }
    }
}

async fn write_varint_prefixed(stream: &mut BoxedStream, value: &Bytes) -> Result<()> {
    let mut len_buf = varint_encode::usize_buffer();
    let prefix = varint_encode::usize(value.len(), &mut len_buf);
    stream.write_all(prefix).await.map_err(|e| OverlayError::LengthMismatch(e.to_string()))?;
    stream.write_all(value).await.map_err(|e| OverlayError::LengthMismatch(e.to_string()))?;
    Ok(())
}

async fn read_varint_prefixed(stream: &mut BoxedStream) -> Result<Bytes> {
    let len = read_varint_len_from_stream(stream).await?;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(|e| OverlayError::LengthMismatch(e.to_string()))?;
    Ok(Bytes::from(buf))
}

async fn read_varint_len_from_stream(stream: &mut BoxedStream) -> Result<usize> {
    let mut buf = [0u8; 10];
    let mut filled = 0;
    loop {
        stream
            .read_exact(&mut buf[filled..filled + 1])
            .await
            .map_err(|e| OverlayError::LengthMismatch(e.to_string()))?;
        if buf[filled] & 0x80 == 0 {
            filled += 1;
            break;
        }
        filled += 1;
        if filled >= buf.len() {
            return Err(OverlayError::LengthMismatch("varint length prefix too long".into()));
        }
    }
    let (value, _) = varint_decode::usize(&buf[..filled]).map_err(|e| OverlayError::LengthMismatch(e.to_string()))?;
    Ok(value)
}

/// Decodes one var-int-length-prefixed value out of an in-memory buffer
/// (the shape of a FINDCONTENT raw-content reply, or a single-key v1
/// stream payload read fully into memory). Returns the value and whatever
/// bytes followed it; callers that expect exactly one value should use
/// [`decode_single_exact`].
pub fn decode_single(bytes: &[u8]) -> Result<(Bytes, Bytes)> {
    let (len, rest) = varint_decode::usize(bytes).map_err(|e| OverlayError::LengthMismatch(e.to_string()))?;
    if rest.len() < len {
        return Err(OverlayError::LengthMismatch("declared length exceeds available bytes".into()));
    }
    let (value, remaining) = rest.split_at(len);
    Ok((Bytes::copy_from_slice(value), Bytes::copy_from_slice(remaining)))
}

/// As [`decode_single`], but a non-empty remainder is `ErrLengthMismatch`
/// rather than returned to the caller (§4.G).
pub fn decode_single_exact(bytes: &[u8]) -> Result<Bytes> {
    let (value, remaining) = decode_single(bytes)?;
    if !remaining.is_empty() {
        return Err(OverlayError::LengthMismatch("trailing bytes after a single framed value".into()));
    }
    Ok(value)
}
