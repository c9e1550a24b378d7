//! Payload types for heap-allocated values, plus the [`Type`] tag that
//! names every built-in type for diagnostics and `typeof`.

pub mod bytes;
pub mod dict;
pub mod file;
pub mod floats;
pub mod function;
pub mod list;
pub mod range;
pub mod str;
pub mod tuple;

pub use bytes::EcBytes;
pub use dict::Dict;
pub use file::File;
pub use floats::Floats;
pub use function::{BuiltinMethod, Cell, Function, Method};
pub use list::List;
pub use range::Range;
pub use str::EcStr;
pub use tuple::Tuple;

use strum::IntoStaticStr;

/// Every built-in type, named the way users see it in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Type {
    Null,
    Int,
    Float,
    Complex,
    String,
    Bytes,
    List,
    Tuple,
    Dict,
    Floats,
    Function,
    Method,
    Range,
    Xptr,
    File,
}

impl Type {
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Numeric types participate in arithmetic promotion.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float | Self::Complex)
    }

    /// Real types (orderable numerics).
    #[must_use]
    pub fn is_real(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }
}

/// A complex number. Numeric only: no ordering, no sequence protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names() {
        assert_eq!(Type::Dict.name(), "dict");
        assert_eq!(Type::String.name(), "string");
        assert!(Type::Float.is_numeric());
        assert!(Type::Float.is_real());
        assert!(Type::Complex.is_numeric());
        assert!(!Type::Complex.is_real());
        assert!(!Type::List.is_numeric());
    }
}
