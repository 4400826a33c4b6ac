//! Byte-level codec for presence flags and component member values.
//!
//! | type           | encoding                                              |
//! |----------------|-------------------------------------------------------|
//! | `bool`         | 1 byte, 0 = false, anything else = true               |
//! | `range[a;b]`   | u8 if `0 <= a && b <= 255`, i8 if within i8, else i32 LE |
//! | `float`        | f64 LE                                                |
//! | `text`, `enum` | UTF-8                                                 |
//! | `complex`      | JSON                                                  |

use bytes::{BufMut, Bytes, BytesMut};

use super::error::EncodingError;
use crate::metadata::{Value, ValueType};

pub fn write_bool(value: bool) -> Bytes {
    Bytes::from_static(if value { &[1] } else { &[0] })
}

pub fn read_bool(payload: &[u8]) -> Result<bool, EncodingError> {
    match payload {
        [byte] => Ok(*byte != 0),
        _ => Err(EncodingError::InvalidLength {
            expected: 1,
            actual: payload.len(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeWidth {
    U8,
    I8,
    I32,
}

fn range_width(min: i64, max: i64) -> RangeWidth {
    if min >= 0 && max <= u8::MAX as i64 {
        RangeWidth::U8
    } else if min >= i8::MIN as i64 && max <= i8::MAX as i64 {
        RangeWidth::I8
    } else {
        RangeWidth::I32
    }
}

fn expect_len(payload: &[u8], expected: usize) -> Result<(), EncodingError> {
    if payload.len() != expected {
        return Err(EncodingError::InvalidLength {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn mismatch(value: &Value, value_type: &ValueType) -> EncodingError {
    EncodingError::TypeMismatch {
        value: value.to_string(),
        value_type: value_type.to_string(),
    }
}

pub fn encode_value(value_type: &ValueType, value: &Value) -> Result<Bytes, EncodingError> {
    if !value_type.validate(value) {
        return Err(mismatch(value, value_type));
    }

    let bytes = match (value_type, value) {
        (ValueType::Bool, Value::Bool(v)) => write_bool(*v),
        (ValueType::Range { min, max }, Value::Int(v)) => {
            let mut buf = BytesMut::with_capacity(4);
            match range_width(*min, *max) {
                RangeWidth::U8 => buf.put_u8(*v as u8),
                RangeWidth::I8 => buf.put_i8(*v as i8),
                RangeWidth::I32 => {
                    let v = i32::try_from(*v).map_err(|_| mismatch(value, value_type))?;
                    buf.put_i32_le(v);
                }
            }
            buf.freeze()
        }
        (ValueType::Float, Value::Float(v)) => {
            let mut buf = BytesMut::with_capacity(8);
            buf.put_f64_le(*v);
            buf.freeze()
        }
        (ValueType::Text | ValueType::Enum(_), Value::Text(v)) => Bytes::from(v.clone()),
        (ValueType::Complex, Value::Complex(v)) => Bytes::from(serde_json::to_vec(v)?),
        (ValueType::Complex, other) => Bytes::from(serde_json::to_vec(other)?),
        _ => return Err(mismatch(value, value_type)),
    };

    Ok(bytes)
}

pub fn decode_value(value_type: &ValueType, payload: &[u8]) -> Result<Value, EncodingError> {
    let value = match value_type {
        ValueType::Bool => Value::Bool(read_bool(payload)?),
        ValueType::Range { min, max } => match range_width(*min, *max) {
            RangeWidth::U8 => {
                expect_len(payload, 1)?;
                Value::Int(payload[0] as i64)
            }
            RangeWidth::I8 => {
                expect_len(payload, 1)?;
                Value::Int(payload[0] as i8 as i64)
            }
            RangeWidth::I32 => {
                expect_len(payload, 4)?;
                let raw = [payload[0], payload[1], payload[2], payload[3]];
                Value::Int(i32::from_le_bytes(raw) as i64)
            }
        },
        ValueType::Float => {
            expect_len(payload, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(payload);
            Value::Float(f64::from_le_bytes(raw))
        }
        ValueType::Text | ValueType::Enum(_) => Value::Text(String::from_utf8(payload.to_vec())?),
        ValueType::Complex => Value::Complex(serde_json::from_slice(payload)?),
    };

    if !value_type.validate(&value) {
        return Err(mismatch(&value, value_type));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_is_single_byte() {
        assert_eq!(write_bool(true).as_ref(), &[1]);
        assert_eq!(write_bool(false).as_ref(), &[0]);
        assert!(read_bool(&[7]).unwrap());
        assert!(read_bool(&[]).is_err());
    }

    #[test]
    fn range_width_follows_bounds() {
        let small = ValueType::range(0, 100).unwrap();
        assert_eq!(encode_value(&small, &Value::Int(100)).unwrap().len(), 1);

        let signed = ValueType::range(-20, 20).unwrap();
        let bytes = encode_value(&signed, &Value::Int(-5)).unwrap();
        assert_eq!(bytes.as_ref(), &[(-5i8) as u8]);
        assert_eq!(decode_value(&signed, &bytes).unwrap(), Value::Int(-5));

        let wide = ValueType::range(-1000, 100_000).unwrap();
        let bytes = encode_value(&wide, &Value::Int(70_000)).unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(decode_value(&wide, &bytes).unwrap(), Value::Int(70_000));
    }

    #[test]
    fn out_of_range_is_rejected() {
        let small = ValueType::range(0, 10).unwrap();
        assert!(encode_value(&small, &Value::Int(11)).is_err());
        assert!(decode_value(&small, &[42]).is_err());
    }

    #[test]
    fn float_and_text() {
        let bytes = encode_value(&ValueType::Float, &Value::Float(21.5)).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode_value(&ValueType::Float, &bytes).unwrap(), Value::Float(21.5));

        let mode: ValueType = "enum{on,off}".parse().unwrap();
        let bytes = encode_value(&mode, &Value::Text("on".into())).unwrap();
        assert_eq!(bytes.as_ref(), b"on");
        assert!(decode_value(&mode, b"auto").is_err());
    }

    #[test]
    fn complex_is_json() {
        let payload = serde_json::json!({"r": 1, "g": 2});
        let bytes = encode_value(&ValueType::Complex, &Value::Complex(payload.clone())).unwrap();
        assert_eq!(
            decode_value(&ValueType::Complex, &bytes).unwrap(),
            Value::Complex(payload)
        );
    }

    #[test]
    fn mismatched_value_is_rejected() {
        assert!(encode_value(&ValueType::Bool, &Value::Int(1)).is_err());
    }
}
