//! Wire decoding of raw input tensors.
//!
//! Binary uploads (multipart `file`, gRPC `chunk`s) carry the flattened NHWC
//! tensor as consecutive little-endian IEEE-754 `f32` values.

use crate::error::ServerError;

/// Decode little-endian `f32` values.
///
/// Fails when the byte length is not a multiple of four or when any value is
/// NaN or infinite.
pub fn decode_f32le(bytes: &[u8]) -> Result<Vec<f32>, ServerError> {
    let words: &[[u8; 4]] = bytemuck::try_cast_slice(bytes).map_err(|_| {
        ServerError::BadRequest(format!(
            "tensor payload length {} is not a multiple of 4 bytes",
            bytes.len()
        ))
    })?;
    let values: Vec<f32> = words.iter().map(|w| f32::from_le_bytes(*w)).collect();
    ensure_finite(&values)?;
    Ok(values)
}

/// Reject NaN and infinite inputs.
pub fn ensure_finite(values: &[f32]) -> Result<(), ServerError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(ServerError::BadRequest(format!(
            "tensor value at index {index} is not finite"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_values() {
        let mut bytes = Vec::new();
        for v in [1.0_f32, -0.5, 255.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(decode_f32le(&bytes).unwrap(), vec![1.0, -0.5, 255.0]);
    }

    #[test]
    fn unaligned_source_is_fine() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&2.0_f32.to_le_bytes());
        assert_eq!(decode_f32le(&bytes[1..]).unwrap(), vec![2.0]);
    }

    #[test]
    fn ragged_length_is_rejected() {
        assert!(matches!(
            decode_f32le(&[0, 0, 128]),
            Err(ServerError::BadRequest(_))
        ));
    }

    #[test]
    fn empty_payload_decodes_to_nothing() {
        assert!(decode_f32le(&[]).unwrap().is_empty());
    }

    #[test]
    fn nan_is_rejected() {
        let bytes = f32::NAN.to_le_bytes();
        assert!(matches!(
            decode_f32le(&bytes),
            Err(ServerError::BadRequest(m)) if m.contains("index 0")
        ));
    }
}
