//! The tagged-union scalar value that flows between elements, relations,
//! fixups and the expression evaluator.
//!
//! A [`Variant`] emulates the loosely typed values of the scripting layer
//! while keeping every conversion explicit and checked: narrowing a numeric
//! value fails when data would be lost, and conversions that cannot be
//! expressed without extra length information (numeric to bytes, bytes to
//! text) fail outright instead of guessing.

use crate::bits::BitStream;
use thiserror::Error;

/// Errors raised by [`Variant`] conversions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// A narrowing numeric conversion would not round-trip.
    #[error("converting this {from} to {to} would cause loss of data")]
    LossOfData { from: &'static str, to: &'static str },

    /// The conversion is not representable (e.g. bytes to text, numeric to bytes).
    #[error("unable to convert {from} to {to}")]
    Unsupported { from: &'static str, to: &'static str },

    /// Text that should hold a decimal integer did not parse as one.
    #[error("unable to parse {text:?} as {to}")]
    UnparsableText { text: String, to: &'static str },

    /// The value has no boolean interpretation (used by When conditions).
    #[error("{0} value has no truth interpretation")]
    NoTruthValue(&'static str),
}

/// A value in exactly one of five representations.
///
/// Variants are immutable once constructed; every mutation in the engine
/// replaces the whole value.
#[derive(Debug, Clone)]
pub enum Variant {
    Int(i32),
    Long(i64),
    ULong(u64),
    Text(String),
    Bytes(Vec<u8>),
    Bits(BitStream),
}

fn parse_decimal<T: std::str::FromStr>(text: &str, to: &'static str) -> Result<T, ValueError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        // The empty string deliberately reads as zero; "0" parses below.
        return "0".parse().map_err(|_| ValueError::UnparsableText {
            text: text.to_string(),
            to,
        });
    }
    trimmed.parse().map_err(|_| ValueError::UnparsableText {
        text: text.to_string(),
        to,
    })
}

impl Variant {
    /// The representation's name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Int(_) => "int",
            Variant::Long(_) => "long",
            Variant::ULong(_) => "ulong",
            Variant::Text(_) => "text",
            Variant::Bytes(_) => "bytes",
            Variant::Bits(_) => "bits",
        }
    }

    /// Reads the value as an `i32`, range-checking wider numerics.
    pub fn as_i32(&self) -> Result<i32, ValueError> {
        match self {
            Variant::Int(v) => Ok(*v),
            Variant::Long(v) => i32::try_from(*v).map_err(|_| ValueError::LossOfData {
                from: "long",
                to: "int",
            }),
            Variant::ULong(v) => i32::try_from(*v).map_err(|_| ValueError::LossOfData {
                from: "ulong",
                to: "int",
            }),
            Variant::Text(s) => parse_decimal(s, "int"),
            Variant::Bytes(_) | Variant::Bits(_) => Err(ValueError::Unsupported {
                from: self.type_name(),
                to: "int",
            }),
        }
    }

    /// Reads the value as an `i64`, range-checking `ULong`.
    pub fn as_i64(&self) -> Result<i64, ValueError> {
        match self {
            Variant::Int(v) => Ok(i64::from(*v)),
            Variant::Long(v) => Ok(*v),
            Variant::ULong(v) => i64::try_from(*v).map_err(|_| ValueError::LossOfData {
                from: "ulong",
                to: "long",
            }),
            Variant::Text(s) => parse_decimal(s, "long"),
            Variant::Bytes(_) | Variant::Bits(_) => Err(ValueError::Unsupported {
                from: self.type_name(),
                to: "long",
            }),
        }
    }

    /// Reads the value as a `u64`; negative numerics fail.
    pub fn as_u64(&self) -> Result<u64, ValueError> {
        match self {
            Variant::Int(v) => u64::try_from(*v).map_err(|_| ValueError::LossOfData {
                from: "int",
                to: "ulong",
            }),
            Variant::Long(v) => u64::try_from(*v).map_err(|_| ValueError::LossOfData {
                from: "long",
                to: "ulong",
            }),
            Variant::ULong(v) => Ok(*v),
            Variant::Text(s) => parse_decimal(s, "ulong"),
            Variant::Bytes(_) | Variant::Bits(_) => Err(ValueError::Unsupported {
                from: self.type_name(),
                to: "ulong",
            }),
        }
    }

    /// Renders the value as text. Numerics format as decimal; byte forms fail.
    pub fn as_text(&self) -> Result<String, ValueError> {
        match self {
            Variant::Int(v) => Ok(v.to_string()),
            Variant::Long(v) => Ok(v.to_string()),
            Variant::ULong(v) => Ok(v.to_string()),
            Variant::Text(s) => Ok(s.clone()),
            Variant::Bytes(_) | Variant::Bits(_) => Err(ValueError::Unsupported {
                from: self.type_name(),
                to: "text",
            }),
        }
    }

    /// Reads the value's byte-sequence form. Only `Bytes` and `Bits` have one.
    pub fn as_bytes(&self) -> Result<Vec<u8>, ValueError> {
        match self {
            Variant::Bytes(b) => Ok(b.clone()),
            Variant::Bits(s) => Ok(s.to_bytes()),
            _ => Err(ValueError::Unsupported {
                from: self.type_name(),
                to: "bytes",
            }),
        }
    }

    /// Reads the value's bit-sequence form. Only `Bytes` and `Bits` have one.
    pub fn to_bits(&self) -> Result<BitStream, ValueError> {
        match self {
            Variant::Bytes(b) => Ok(BitStream::from_bytes(b)),
            Variant::Bits(s) => Ok(s.clone()),
            _ => Err(ValueError::Unsupported {
                from: self.type_name(),
                to: "bits",
            }),
        }
    }

    /// Boolean interpretation used by When conditions: nonzero numerics are
    /// true, the texts `"true"`/`"false"` (any case) map directly, numeric
    /// text is parsed first. Byte forms have no truth value.
    pub fn truthy(&self) -> Result<bool, ValueError> {
        match self {
            Variant::Int(v) => Ok(*v != 0),
            Variant::Long(v) => Ok(*v != 0),
            Variant::ULong(v) => Ok(*v != 0),
            Variant::Text(s) => {
                let lowered = s.trim().to_ascii_lowercase();
                match lowered.as_str() {
                    "true" => Ok(true),
                    "false" => Ok(false),
                    _ => Ok(self.as_i64().map_err(|_| ValueError::NoTruthValue("text"))? != 0),
                }
            }
            Variant::Bytes(_) | Variant::Bits(_) => {
                Err(ValueError::NoTruthValue(self.type_name()))
            }
        }
    }
}

/// Equality tries text coercion first (so `Int(5)` equals `Text("5")`), then
/// falls back to comparing byte-sequence forms; byte sequences of differing
/// length are never equal. A pair where one side is only text-coercible and
/// the other only byte-coercible compares unequal.
impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        if let (Ok(a), Ok(b)) = (self.as_text(), other.as_text()) {
            return a == b;
        }
        match (self.as_bytes(), other.as_bytes()) {
            (Ok(a), Ok(b)) => a.len() == b.len() && a == b,
            _ => false,
        }
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Long(v)
    }
}

impl From<u64> for Variant {
    fn from(v: u64) -> Self {
        Variant::ULong(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::Text(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::Text(v)
    }
}

impl From<Vec<u8>> for Variant {
    fn from(v: Vec<u8>) -> Self {
        Variant::Bytes(v)
    }
}

impl From<BitStream> for Variant {
    fn from(v: BitStream) -> Self {
        Variant::Bits(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_converts_to_zero() {
        let v = Variant::Text(String::new());
        assert_eq!(v.as_i32().unwrap(), 0);
        assert_eq!(v.as_i64().unwrap(), 0);
        assert_eq!(v.as_u64().unwrap(), 0);
    }

    #[test]
    fn text_parses_decimal() {
        let v = Variant::Text("  -42 ".to_string());
        assert_eq!(v.as_i64().unwrap(), -42);
        assert!(v.as_u64().is_err());
        assert!(Variant::Text("0x10".to_string()).as_i64().is_err());
    }

    #[test]
    fn narrowing_range_checks() {
        assert_eq!(Variant::Long(i64::from(i32::MAX)).as_i32().unwrap(), i32::MAX);
        assert_eq!(
            Variant::Long(i64::from(i32::MAX) + 1).as_i32().unwrap_err(),
            ValueError::LossOfData { from: "long", to: "int" }
        );
        assert_eq!(
            Variant::ULong(u64::MAX).as_i64().unwrap_err(),
            ValueError::LossOfData { from: "ulong", to: "long" }
        );
        assert_eq!(
            Variant::Int(-1).as_u64().unwrap_err(),
            ValueError::LossOfData { from: "int", to: "ulong" }
        );
    }

    #[test]
    fn bytes_do_not_convert_to_text_or_numeric() {
        let v = Variant::Bytes(vec![1, 2, 3]);
        assert!(matches!(v.as_text(), Err(ValueError::Unsupported { .. })));
        assert!(matches!(v.as_i32(), Err(ValueError::Unsupported { .. })));
    }

    #[test]
    fn numerics_do_not_convert_to_bytes() {
        assert!(matches!(
            Variant::Int(7).as_bytes(),
            Err(ValueError::Unsupported { .. })
        ));
        assert!(matches!(
            Variant::ULong(7).to_bits(),
            Err(ValueError::Unsupported { .. })
        ));
    }

    #[test]
    fn bits_and_bytes_interconvert() {
        let bits = BitStream::from_bytes(&[0xca, 0xfe]);
        assert_eq!(Variant::Bits(bits.clone()).as_bytes().unwrap(), vec![0xca, 0xfe]);
        assert_eq!(Variant::Bytes(vec![0xca, 0xfe]).to_bits().unwrap(), bits);
    }

    #[test]
    fn equality_coerces_text_first() {
        assert_eq!(Variant::Int(5), Variant::Text("5".to_string()));
        assert_eq!(Variant::ULong(5), Variant::Long(5));
        assert_ne!(Variant::Int(5), Variant::Text("6".to_string()));
    }

    #[test]
    fn equality_falls_back_to_byte_form() {
        assert_eq!(Variant::Bytes(vec![1, 2, 3]), Variant::Bytes(vec![1, 2, 3]));
        assert_ne!(Variant::Bytes(vec![1, 2, 3]), Variant::Bytes(vec![1, 2]));
        let bits = BitStream::from_bytes(&[1, 2, 3]);
        assert_eq!(Variant::Bits(bits), Variant::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn equality_across_text_and_byte_worlds_is_false() {
        assert_ne!(Variant::Int(1), Variant::Bytes(vec![1]));
        assert_ne!(Variant::Text("1".to_string()), Variant::Bytes(vec![b'1']));
    }

    #[test]
    fn truthiness() {
        assert!(Variant::Int(1).truthy().unwrap());
        assert!(!Variant::ULong(0).truthy().unwrap());
        assert!(Variant::Text("True".to_string()).truthy().unwrap());
        assert!(!Variant::Text("false".to_string()).truthy().unwrap());
        assert!(Variant::Text("3".to_string()).truthy().unwrap());
        assert!(Variant::Text("maybe".to_string()).truthy().is_err());
        assert!(Variant::Bytes(vec![1]).truthy().is_err());
    }
}
