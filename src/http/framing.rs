//! Binary request body that carries a JSON document and a raw image together:
//! `[u32 big-endian JSON length][JSON bytes][image bytes]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const FRAMED_CONTENT_TYPE: &str = "application/octet-stream";

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("JSON section too large: {0} bytes")]
    JsonTooLarge(usize),

    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

pub fn encode(json: &[u8], image: &[u8]) -> Result<Bytes, FramingError> {
    let len = u32::try_from(json.len()).map_err(|_| FramingError::JsonTooLarge(json.len()))?;

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + json.len() + image.len());
    buf.put_u32(len);
    buf.put_slice(json);
    buf.put_slice(image);
    Ok(buf.freeze())
}

/// Split a framed body into its JSON and image sections
pub fn decode(mut frame: Bytes) -> Result<(Bytes, Bytes), FramingError> {
    if frame.len() < LENGTH_PREFIX {
        return Err(FramingError::Truncated {
            needed: LENGTH_PREFIX,
            available: frame.len(),
        });
    }

    let json_len = frame.get_u32() as usize;
    if frame.len() < json_len {
        return Err(FramingError::Truncated {
            needed: json_len,
            available: frame.len(),
        });
    }

    let json = frame.split_to(json_len);
    Ok((json, frame))
}
