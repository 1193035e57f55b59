//! Typed preference values and their canonical, self-describing byte encoding.
//!
//! Every encoded value starts with a one-byte type tag followed by a
//! tag-specific payload. Multi-byte integers are little-endian; variable-length
//! payloads carry a `u32` length prefix.

use std::{collections::BTreeSet, fmt};

use thiserror::Error;

const TAG_STRING: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_LONG: u8 = 0x05;
const TAG_STRING_SET: u8 = 0x06;

/// A value stored under a preference key.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    String(String),
    Int(i32),
    Bool(bool),
    Float(f32),
    Long(i64),
    StringSet(BTreeSet<String>),
}

/// The type tag of a [`TypedValue`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    String,
    Int,
    Bool,
    Float,
    Long,
    StringSet,
}

impl ValueKind {
    /// Wire tag for this kind.
    pub const fn tag(self) -> u8 {
        match self {
            ValueKind::String => TAG_STRING,
            ValueKind::Int => TAG_INT,
            ValueKind::Bool => TAG_BOOL,
            ValueKind::Float => TAG_FLOAT,
            ValueKind::Long => TAG_LONG,
            ValueKind::StringSet => TAG_STRING_SET,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_STRING => Some(ValueKind::String),
            TAG_INT => Some(ValueKind::Int),
            TAG_BOOL => Some(ValueKind::Bool),
            TAG_FLOAT => Some(ValueKind::Float),
            TAG_LONG => Some(ValueKind::Long),
            TAG_STRING_SET => Some(ValueKind::StringSet),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Int => "int",
            ValueKind::Bool => "bool",
            ValueKind::Float => "float",
            ValueKind::Long => "long",
            ValueKind::StringSet => "string-set",
        };
        f.write_str(name)
    }
}

/// Reasons an encoded value could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("malformed value: empty input")]
    Empty,
    #[error("malformed value: unknown type tag {0:#04x}")]
    UnknownTag(u8),
    #[error("malformed value: {kind} payload truncated")]
    Truncated { kind: ValueKind },
    #[error("malformed value: {extra} trailing bytes after {kind} payload")]
    TrailingBytes { kind: ValueKind, extra: usize },
    #[error("malformed value: string is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed value: bool byte {0:#04x} is neither 0 nor 1")]
    InvalidBool(u8),
}

impl TypedValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            TypedValue::String(_) => ValueKind::String,
            TypedValue::Int(_) => ValueKind::Int,
            TypedValue::Bool(_) => ValueKind::Bool,
            TypedValue::Float(_) => ValueKind::Float,
            TypedValue::Long(_) => ValueKind::Long,
            TypedValue::StringSet(_) => ValueKind::StringSet,
        }
    }

    /// Encode into the canonical tagged form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.kind().tag()];
        match self {
            TypedValue::String(s) => put_str(&mut buf, s),
            TypedValue::Int(v) => buf.extend_from_slice(&v.to_le_bytes()),
            TypedValue::Bool(v) => buf.push(u8::from(*v)),
            TypedValue::Float(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
            TypedValue::Long(v) => buf.extend_from_slice(&v.to_le_bytes()),
            TypedValue::StringSet(set) => {
                buf.extend_from_slice(&len_u32(set.len()).to_le_bytes());
                for item in set {
                    put_str(&mut buf, item);
                }
            }
        }
        buf
    }

    /// Decode a value produced by [`TypedValue::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ValueError> {
        let (&tag, payload) = bytes.split_first().ok_or(ValueError::Empty)?;
        let kind = ValueKind::from_tag(tag).ok_or(ValueError::UnknownTag(tag))?;
        let mut reader = Reader { kind, rest: payload };

        let value = match kind {
            ValueKind::String => TypedValue::String(reader.string()?),
            ValueKind::Int => TypedValue::Int(i32::from_le_bytes(reader.array()?)),
            ValueKind::Bool => match reader.array::<1>()?[0] {
                0 => TypedValue::Bool(false),
                1 => TypedValue::Bool(true),
                other => return Err(ValueError::InvalidBool(other)),
            },
            ValueKind::Float => TypedValue::Float(f32::from_bits(u32::from_le_bytes(reader.array()?))),
            ValueKind::Long => TypedValue::Long(i64::from_le_bytes(reader.array()?)),
            ValueKind::StringSet => {
                let count = u32::from_le_bytes(reader.array()?);
                let mut set = BTreeSet::new();
                for _ in 0..count {
                    set.insert(reader.string()?);
                }
                TypedValue::StringSet(set)
            }
        };

        if !reader.rest.is_empty() {
            return Err(ValueError::TrailingBytes {
                kind,
                extra: reader.rest.len(),
            });
        }
        Ok(value)
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&len_u32(s.len()).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn len_u32(len: usize) -> u32 {
    // Preference payloads are bounded far below 4 GiB by the journal record limit.
    u32::try_from(len).unwrap_or(u32::MAX)
}

struct Reader<'a> {
    kind: ValueKind,
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ValueError> {
        if self.rest.len() < n {
            return Err(ValueError::Truncated { kind: self.kind });
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ValueError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn string(&mut self) -> Result<String, ValueError> {
        let len = u32::from_le_bytes(self.array()?) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ValueError::InvalidUtf8)
    }
}

/// Primitive types that can be stored as a preference.
pub trait Preference: Sized + Into<TypedValue> {
    const KIND: ValueKind;

    /// Extract the primitive, or `None` when the value holds another kind.
    fn from_value(value: TypedValue) -> Option<Self>;
}

macro_rules! preference {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for TypedValue {
            fn from(value: $ty) -> Self {
                TypedValue::$variant(value)
            }
        }

        impl Preference for $ty {
            const KIND: ValueKind = ValueKind::$variant;

            fn from_value(value: TypedValue) -> Option<Self> {
                match value {
                    TypedValue::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

preference!(String, String);
preference!(i32, Int);
preference!(bool, Bool);
preference!(f32, Float);
preference!(i64, Long);
preference!(BTreeSet<String>, StringSet);

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        TypedValue::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn any_value() -> impl Strategy<Value = TypedValue> {
        prop_oneof![
            ".*".prop_map(TypedValue::String),
            any::<i32>().prop_map(TypedValue::Int),
            any::<bool>().prop_map(TypedValue::Bool),
            (-1.0e9f32..1.0e9f32).prop_map(TypedValue::Float),
            any::<i64>().prop_map(TypedValue::Long),
            prop::collection::btree_set(".{0,12}", 0..8).prop_map(TypedValue::StringSet),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(value in any_value()) {
            prop_assert_eq!(TypedValue::decode(&value.encode()).unwrap(), value);
        }
    }

    #[test]
    fn nan_round_trips_bitwise() {
        let nan = f32::from_bits(0x7fc0_1234);
        match TypedValue::decode(&TypedValue::Float(nan).encode()).unwrap() {
            TypedValue::Float(back) => assert_eq!(back.to_bits(), nan.to_bits()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn layout_is_tag_then_little_endian_payload() {
        assert_eq!(TypedValue::Int(1).encode(), vec![0x02, 1, 0, 0, 0]);
        assert_eq!(TypedValue::Bool(true).encode(), vec![0x03, 1]);
        assert_eq!(
            TypedValue::String("hi".into()).encode(),
            vec![0x01, 2, 0, 0, 0, b'h', b'i']
        );
    }

    #[test]
    fn rejects_unknown_tag() {
        assert_eq!(TypedValue::decode(&[0x7f, 0]), Err(ValueError::UnknownTag(0x7f)));
        assert_eq!(TypedValue::decode(&[]), Err(ValueError::Empty));
    }

    #[test]
    fn rejects_length_mismatch() {
        assert_eq!(
            TypedValue::decode(&[0x05, 1, 2, 3]),
            Err(ValueError::Truncated {
                kind: ValueKind::Long
            })
        );
        assert_eq!(
            TypedValue::decode(&[0x02, 1, 0, 0, 0, 9]),
            Err(ValueError::TrailingBytes {
                kind: ValueKind::Int,
                extra: 1
            })
        );
        // string claims 10 bytes, carries 2
        assert!(matches!(
            TypedValue::decode(&[0x01, 10, 0, 0, 0, b'h', b'i']),
            Err(ValueError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_invalid_bool_and_utf8() {
        assert_eq!(TypedValue::decode(&[0x03, 2]), Err(ValueError::InvalidBool(2)));
        assert_eq!(
            TypedValue::decode(&[0x01, 1, 0, 0, 0, 0xff]),
            Err(ValueError::InvalidUtf8)
        );
    }

    #[test]
    fn preference_extracts_matching_kind_only() {
        assert_eq!(i64::from_value(TypedValue::Long(7)), Some(7));
        assert_eq!(i64::from_value(TypedValue::Int(7)), None);
        assert_eq!(<BTreeSet<String>>::KIND, ValueKind::StringSet);
    }
}
