//! Binary encoding and decoding of [`Value`] trees.

use bytes::{Buf, BufMut, BytesMut};

use super::{Choice, ChoiceKind, Fraction, Object, PropFlags, Property, Rectangle, Value, pod_type};
use crate::error::PodError;

const ALIGN: usize = 8;
const HEADER_SIZE: usize = 8;

fn padded(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

fn need(buf: &[u8], needed: usize) -> Result<(), PodError> {
    if buf.len() < needed {
        return Err(PodError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Body size of a scalar pod type, or `None` if the type cannot appear
/// inside a choice.
fn scalar_size(ty: u32) -> Option<usize> {
    match ty {
        pod_type::BOOL | pod_type::ID | pod_type::INT => Some(4),
        pod_type::LONG | pod_type::RECTANGLE | pod_type::FRACTION => Some(8),
        _ => None,
    }
}

// ── Encoding ─────────────────────────────────────────────────────

/// Serialize a value to its little-endian POD representation.
pub fn encode(value: &Value) -> Result<Vec<u8>, PodError> {
    let mut buf = BytesMut::with_capacity(256);
    write_pod(&mut buf, value)?;
    Ok(buf.to_vec())
}

fn write_pod(buf: &mut BytesMut, value: &Value) -> Result<(), PodError> {
    let start = buf.len();
    buf.put_u32_le(0); // size, patched below
    buf.put_u32_le(value.pod_type());
    write_body(buf, value)?;

    let size = buf.len() - start - HEADER_SIZE;
    buf[start..start + 4].copy_from_slice(&(size as u32).to_le_bytes());
    buf.put_bytes(0, padded(size) - size);
    Ok(())
}

fn write_body(buf: &mut BytesMut, value: &Value) -> Result<(), PodError> {
    match value {
        Value::None => {}
        Value::Bool(b) => buf.put_u32_le(u32::from(*b)),
        Value::Id(v) => buf.put_u32_le(*v),
        Value::Int(v) => buf.put_i32_le(*v),
        Value::Long(v) => buf.put_i64_le(*v),
        Value::Rectangle(r) => {
            buf.put_u32_le(r.width);
            buf.put_u32_le(r.height);
        }
        Value::Fraction(f) => {
            buf.put_u32_le(f.num);
            buf.put_u32_le(f.denom);
        }
        Value::Choice(choice) => write_choice(buf, choice)?,
        Value::Object(object) => {
            buf.put_u32_le(object.object_type);
            buf.put_u32_le(object.id);
            for prop in &object.properties {
                buf.put_u32_le(prop.key);
                buf.put_u32_le(prop.flags.bits());
                write_pod(buf, &prop.value)?;
            }
        }
        Value::Opaque { body, .. } => buf.put_slice(body),
    }
    Ok(())
}

fn write_choice(buf: &mut BytesMut, choice: &Choice) -> Result<(), PodError> {
    let first = choice
        .values
        .first()
        .ok_or(PodError::Malformed("empty choice"))?;
    let child_type = first.pod_type();
    let child_size =
        scalar_size(child_type).ok_or(PodError::Malformed("choice of non-scalar values"))?;
    if choice.values.iter().any(|v| v.pod_type() != child_type) {
        return Err(PodError::Malformed("choice values of mixed types"));
    }

    buf.put_u32_le(choice.kind.as_raw());
    buf.put_u32_le(choice.flags);
    buf.put_u32_le(child_size as u32);
    buf.put_u32_le(child_type);
    for v in &choice.values {
        write_body(buf, v)?;
    }
    Ok(())
}

// ── Decoding ─────────────────────────────────────────────────────

/// Parse one POD from the front of `bytes`. Trailing bytes are ignored.
pub fn decode(bytes: &[u8]) -> Result<Value, PodError> {
    let mut cursor = bytes;
    read_pod(&mut cursor)
}

fn read_pod(buf: &mut &[u8]) -> Result<Value, PodError> {
    need(*buf, HEADER_SIZE)?;
    let size = buf.get_u32_le() as usize;
    let ty = buf.get_u32_le();
    need(*buf, size)?;

    let current: &[u8] = *buf;
    let (body, rest) = current.split_at(size);
    let value = read_body(ty, body)?;

    // The final pod of a buffer may omit its padding.
    let pad = (padded(size) - size).min(rest.len());
    *buf = &rest[pad..];
    Ok(value)
}

fn read_body(ty: u32, mut body: &[u8]) -> Result<Value, PodError> {
    if let Some(size) = scalar_size(ty) {
        need(body, size)?;
    }
    let value = match ty {
        pod_type::NONE => Value::None,
        pod_type::BOOL => Value::Bool(body.get_u32_le() != 0),
        pod_type::ID => Value::Id(body.get_u32_le()),
        pod_type::INT => Value::Int(body.get_i32_le()),
        pod_type::LONG => Value::Long(body.get_i64_le()),
        pod_type::RECTANGLE => Value::Rectangle(Rectangle {
            width: body.get_u32_le(),
            height: body.get_u32_le(),
        }),
        pod_type::FRACTION => Value::Fraction(Fraction {
            num: body.get_u32_le(),
            denom: body.get_u32_le(),
        }),
        pod_type::CHOICE => Value::Choice(read_choice(body)?),
        pod_type::OBJECT => Value::Object(read_object(body)?),
        other => Value::Opaque {
            pod_type: other,
            body: body.to_vec(),
        },
    };
    Ok(value)
}

fn read_choice(mut body: &[u8]) -> Result<Choice, PodError> {
    need(body, 16)?;
    let kind = ChoiceKind::from_raw(body.get_u32_le())
        .ok_or(PodError::Malformed("unknown choice kind"))?;
    let flags = body.get_u32_le();
    let child_size = body.get_u32_le() as usize;
    let child_type = body.get_u32_le();

    let expected =
        scalar_size(child_type).ok_or(PodError::Malformed("choice of non-scalar values"))?;
    if child_size != expected {
        return Err(PodError::Malformed("choice child size does not match its type"));
    }

    let values = body
        .chunks_exact(child_size)
        .map(|chunk| read_body(child_type, chunk))
        .collect::<Result<Vec<_>, _>>()?;
    if values.is_empty() {
        return Err(PodError::Malformed("empty choice"));
    }

    Ok(Choice {
        kind,
        flags,
        values,
    })
}

fn read_object(mut body: &[u8]) -> Result<Object, PodError> {
    need(body, 8)?;
    let object_type = body.get_u32_le();
    let id = body.get_u32_le();

    let mut properties = Vec::new();
    while !body.is_empty() {
        need(body, 8)?;
        let key = body.get_u32_le();
        let flags = PropFlags::from_bits_retain(body.get_u32_le());
        let value = read_pod(&mut body)?;
        properties.push(Property { key, flags, value });
    }

    Ok(Object {
        object_type,
        id,
        properties,
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{format_key, object_type, param_id};

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn int_is_padded_to_eight() {
        let bytes = encode(&Value::Int(-2)).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(u32_at(&bytes, 0), 4);
        assert_eq!(u32_at(&bytes, 4), pod_type::INT);
        assert_eq!(&bytes[8..12], &(-2i32).to_le_bytes());
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn choice_layout_packs_children() {
        let choice = Choice::range(Value::Int(8), Value::Int(8), Value::Int(64));
        let bytes = encode(&Value::Choice(choice)).unwrap();
        // 8 header + 16 choice header + 3 * 4 values = 36, padded to 40.
        assert_eq!(bytes.len(), 40);
        assert_eq!(u32_at(&bytes, 0), 28);
        assert_eq!(u32_at(&bytes, 4), pod_type::CHOICE);
        assert_eq!(u32_at(&bytes, 8), ChoiceKind::Range.as_raw());
        assert_eq!(u32_at(&bytes, 16), 4);
        assert_eq!(u32_at(&bytes, 20), pod_type::INT);
        assert_eq!(u32_at(&bytes, 24), 8);
        assert_eq!(u32_at(&bytes, 28), 8);
        assert_eq!(u32_at(&bytes, 32), 64);
    }

    #[test]
    fn object_size_counts_padded_properties() {
        let obj = Object::new(object_type::FORMAT, param_id::FORMAT)
            .with(format_key::MEDIA_TYPE, Value::Id(2))
            .with(format_key::VIDEO_FORMAT, Value::Id(8));
        let bytes = encode(&Value::Object(obj.clone())).unwrap();
        // body: 8 (type, id) + 2 * (8 prop header + 16 padded id pod)
        assert_eq!(u32_at(&bytes, 0), 56);
        assert_eq!(bytes.len(), 64);
        assert_eq!(decode(&bytes).unwrap(), Value::Object(obj));
    }

    #[test]
    fn nested_choice_in_object_decodes() {
        let obj = Object::new(object_type::FORMAT, param_id::ENUM_FORMAT).with_flags(
            format_key::VIDEO_MODIFIER,
            PropFlags::MANDATORY | PropFlags::DONT_FIXATE,
            Value::Choice(Choice::enumeration(
                Value::Long(0),
                [Value::Long(0), Value::Long(0x00ff_ffff_ffff_ffff)],
            )),
        );
        let decoded = decode(&encode(&Value::Object(obj.clone())).unwrap()).unwrap();
        assert_eq!(decoded, Value::Object(obj));
    }

    #[test]
    fn unknown_types_are_preserved() {
        let opaque = Value::Opaque {
            pod_type: 8, // string
            body: b"BGRx\0".to_vec(),
        };
        let decoded = decode(&encode(&opaque).unwrap()).unwrap();
        assert_eq!(decoded, opaque);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = encode(&Value::Long(5)).unwrap();
        assert!(matches!(
            decode(&bytes[..10]),
            Err(PodError::Truncated { .. })
        ));
        assert!(matches!(decode(&[1, 2, 3]), Err(PodError::Truncated { .. })));
    }

    #[test]
    fn mixed_choice_is_rejected() {
        let choice = Choice {
            kind: ChoiceKind::Enum,
            flags: 0,
            values: vec![Value::Int(1), Value::Long(2)],
        };
        assert_eq!(
            encode(&Value::Choice(choice)),
            Err(PodError::Malformed("choice values of mixed types"))
        );
    }

    #[test]
    fn empty_choice_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&pod_type::CHOICE.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&pod_type::INT.to_le_bytes());
        assert_eq!(decode(&bytes), Err(PodError::Malformed("empty choice")));
    }
}
