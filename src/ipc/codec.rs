use super::IpcError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

/// Default upper bound for a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Build the 4-byte big-endian length-prefixed frame codec.
///
/// Frames larger than `max_frame_bytes` are rejected with an I/O error on
/// both encode and decode.
#[must_use]
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Serialize `message` into a frame payload.
///
/// # Errors
///
/// Returns `IpcError::Json` if serialization fails.
pub fn encode_payload<T: Serialize>(message: &T) -> Result<Bytes, IpcError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Deserialize a frame payload.
///
/// # Errors
///
/// Returns `IpcError::Json` if the payload is not a valid document of type `T`.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, IpcError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_frame_has_big_endian_length_prefix() -> Result<(), IpcError> {
        let mut codec = frame_codec(DEFAULT_MAX_FRAME_BYTES);
        let mut buf = BytesMut::new();

        codec.encode(encode_payload(&serde_json::json!({"a": 1}))?, &mut buf)?;

        assert_eq!(&buf[..4], &[0, 0, 0, 7]);
        assert_eq!(&buf[4..], br#"{"a":1}"#);
        Ok(())
    }

    #[test]
    fn test_decoder_waits_for_full_frame() -> Result<(), IpcError> {
        let mut codec = frame_codec(DEFAULT_MAX_FRAME_BYTES);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, b'h', b'e'][..]);

        assert!(codec.decode(&mut buf)?.is_none());

        buf.extend_from_slice(b"llo");
        let frame = codec.decode(&mut buf)?;
        assert_eq!(frame.as_deref(), Some(&b"hello"[..]));
        Ok(())
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = frame_codec(8);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 64][..]);

        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_payload_rejects_garbage() {
        let result: Result<serde_json::Value, _> = decode_payload(b"not json");
        assert!(matches!(result, Err(IpcError::Json(_))));
    }
}
