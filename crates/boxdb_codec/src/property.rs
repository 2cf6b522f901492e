//! Property value types understood by the record format.

use std::fmt;

/// The semantic type of a property, which fixes how its slot is encoded.
///
/// The numeric discriminants are persisted in the store manifest and must
/// never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyType {
    /// One byte, 0 or 1.
    Bool = 1,
    /// Signed 8-bit integer.
    Byte = 2,
    /// Signed 16-bit integer.
    Short = 3,
    /// 16-bit character code.
    Char = 4,
    /// Signed 32-bit integer.
    Int = 5,
    /// Signed 64-bit integer.
    Long = 6,
    /// 32-bit float.
    Float = 7,
    /// 64-bit float.
    Double = 8,
    /// UTF-8 string, stored out of line.
    String = 9,
    /// Milliseconds since the Unix epoch.
    Date = 10,
    /// Target object id of a to-one relation.
    Relation = 11,
    /// Nanoseconds since the Unix epoch.
    DateNano = 12,
    /// Raw bytes, stored out of line.
    ByteVector = 23,
}

impl PropertyType {
    /// Converts a persisted discriminant back into a type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::Bool,
            2 => Self::Byte,
            3 => Self::Short,
            4 => Self::Char,
            5 => Self::Int,
            6 => Self::Long,
            7 => Self::Float,
            8 => Self::Double,
            9 => Self::String,
            10 => Self::Date,
            11 => Self::Relation,
            12 => Self::DateNano,
            23 => Self::ByteVector,
            _ => return None,
        })
    }

    /// Returns the persisted discriminant.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Width in bytes of the inline encoding, or `None` for out-of-line types.
    #[must_use]
    pub const fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Bool | Self::Byte => Some(1),
            Self::Short | Self::Char => Some(2),
            Self::Int | Self::Float => Some(4),
            Self::Long | Self::Double | Self::Date | Self::DateNano | Self::Relation => Some(8),
            Self::String | Self::ByteVector => None,
        }
    }

    /// True for the integer-like types, including dates and relation ids.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Bool
                | Self::Byte
                | Self::Short
                | Self::Char
                | Self::Int
                | Self::Long
                | Self::Date
                | Self::DateNano
                | Self::Relation
        )
    }

    /// True for `Float` and `Double`.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Human readable name used in error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Char => "char",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Date => "date",
            Self::Relation => "relation",
            Self::DateNano => "date-nano",
            Self::ByteVector => "byte-vector",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PropertyType; 13] = [
        PropertyType::Bool,
        PropertyType::Byte,
        PropertyType::Short,
        PropertyType::Char,
        PropertyType::Int,
        PropertyType::Long,
        PropertyType::Float,
        PropertyType::Double,
        PropertyType::String,
        PropertyType::Date,
        PropertyType::Relation,
        PropertyType::DateNano,
        PropertyType::ByteVector,
    ];

    #[test]
    fn discriminants_are_stable() {
        for ty in ALL {
            assert_eq!(PropertyType::from_byte(ty.as_byte()), Some(ty));
        }
        assert_eq!(PropertyType::String.as_byte(), 9);
        assert_eq!(PropertyType::ByteVector.as_byte(), 23);
        assert_eq!(PropertyType::from_byte(0), None);
    }

    #[test]
    fn only_string_and_bytes_are_out_of_line() {
        for ty in ALL {
            let out_of_line = ty.fixed_width().is_none();
            assert_eq!(
                out_of_line,
                matches!(ty, PropertyType::String | PropertyType::ByteVector)
            );
        }
    }
}
