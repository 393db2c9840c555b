//! Runtime-typed values carried by data-change notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Value of a variable whose type is only known at runtime
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Variant {
    #[default]
    Empty,
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    ByteString(Vec<u8>),
    /// One-dimensional or flattened multi-dimensional array
    Array(Vec<Variant>),
    /// Built-in type this client reads past without interpreting, by type id
    Other(u8),
}

/// A variant could not be read as a number
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Expected a numeric value, got {found}")]
pub struct ConversionError {
    /// Type name of the offending variant
    pub found: &'static str,
}

impl Variant {
    /// Type name as used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Empty => "Empty",
            Variant::Boolean(_) => "Boolean",
            Variant::SByte(_) => "SByte",
            Variant::Byte(_) => "Byte",
            Variant::Int16(_) => "Int16",
            Variant::UInt16(_) => "UInt16",
            Variant::Int32(_) => "Int32",
            Variant::UInt32(_) => "UInt32",
            Variant::Int64(_) => "Int64",
            Variant::UInt64(_) => "UInt64",
            Variant::Float(_) => "Float",
            Variant::Double(_) => "Double",
            Variant::String(_) => "String",
            Variant::DateTime(_) => "DateTime",
            Variant::ByteString(_) => "ByteString",
            Variant::Array(_) => "Array",
            Variant::Other(type_id) => builtin_type_name(*type_id),
        }
    }

    /// Read the value as a float. Integer and floating point variants
    /// convert; everything else is a [`ConversionError`].
    pub fn as_numeric(&self) -> Result<f64, ConversionError> {
        match *self {
            Variant::SByte(v) => Ok(v as f64),
            Variant::Byte(v) => Ok(v as f64),
            Variant::Int16(v) => Ok(v as f64),
            Variant::UInt16(v) => Ok(v as f64),
            Variant::Int32(v) => Ok(v as f64),
            Variant::UInt32(v) => Ok(v as f64),
            Variant::Int64(v) => Ok(v as f64),
            Variant::UInt64(v) => Ok(v as f64),
            Variant::Float(v) => Ok(v as f64),
            Variant::Double(v) => Ok(v),
            _ => Err(ConversionError {
                found: self.type_name(),
            }),
        }
    }
}

/// Name of a built-in type id from the binary encoding
pub(crate) fn builtin_type_name(type_id: u8) -> &'static str {
    match type_id {
        0 => "Null",
        1 => "Boolean",
        2 => "SByte",
        3 => "Byte",
        4 => "Int16",
        5 => "UInt16",
        6 => "Int32",
        7 => "UInt32",
        8 => "Int64",
        9 => "UInt64",
        10 => "Float",
        11 => "Double",
        12 => "String",
        13 => "DateTime",
        14 => "Guid",
        15 => "ByteString",
        16 => "XmlElement",
        17 => "NodeId",
        18 => "ExpandedNodeId",
        19 => "StatusCode",
        20 => "QualifiedName",
        21 => "LocalizedText",
        22 => "ExtensionObject",
        23 => "DataValue",
        24 => "Variant",
        25 => "DiagnosticInfo",
        _ => "Unknown",
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Variant::Double(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_variants_convert() {
        assert_eq!(Variant::Double(57.345).as_numeric(), Ok(57.345));
        assert_eq!(Variant::Float(1.5).as_numeric(), Ok(1.5));
        assert_eq!(Variant::Int32(-12).as_numeric(), Ok(-12.0));
        assert_eq!(Variant::UInt16(4095).as_numeric(), Ok(4095.0));
        assert_eq!(Variant::Byte(7).as_numeric(), Ok(7.0));
    }

    #[test]
    fn test_non_numeric_variants_fail() {
        assert_eq!(
            Variant::from("hot").as_numeric(),
            Err(ConversionError { found: "String" })
        );
        assert_eq!(
            Variant::Boolean(true).as_numeric(),
            Err(ConversionError { found: "Boolean" })
        );
        assert_eq!(
            Variant::Empty.as_numeric(),
            Err(ConversionError { found: "Empty" })
        );
        assert_eq!(
            Variant::Array(vec![Variant::Double(1.0)]).as_numeric(),
            Err(ConversionError { found: "Array" })
        );
        assert_eq!(
            Variant::Other(19).as_numeric(),
            Err(ConversionError { found: "StatusCode" })
        );
    }
}
