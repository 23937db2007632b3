//! Core type definitions for atomstore

use serde::{Deserialize, Serialize};

/// Unique persistent identifier for atoms
///
/// Allocated monotonically by the TLB; once bound to a persisted atom it is
/// never reissued. Zero is the invalid sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uuid(pub u64);

/// The "no such atom" sentinel
pub const INVALID_UUID: Uuid = Uuid(0);

impl Uuid {
    pub fn new(id: u64) -> Self {
        Uuid(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique persistent identifier for values
///
/// Lives in its own namespace, independent of [`Uuid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vuid(pub u64);

impl Vuid {
    pub fn new(id: u64) -> Self {
        Vuid(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Vuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime type code issued by the type registry
pub type TypeId = u16;

/// Sentinel for "this runtime has no such type"
pub const NOTYPE: TypeId = u16::MAX;

/// The unique index on Atoms(type, name) rejects rows past this size
pub const MAX_NODE_NAME_BYTES: usize = 2700;

/// The unique index on Atoms(type, outgoing) rejects rows past this arity
pub const MAX_LINK_ARITY: usize = 330;

/// Tag selecting the interpretation of the (mean, confidence, count) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TvKind {
    Simple,
    Count,
    Indefinite,
    Probabilistic,
}

impl TvKind {
    /// Wire code stored in the `tv_type` column
    pub fn wire_code(&self) -> i32 {
        match self {
            TvKind::Simple => 1,
            TvKind::Count => 2,
            TvKind::Indefinite => 3,
            TvKind::Probabilistic => 4,
        }
    }

    pub fn from_wire_code(code: i32) -> Option<TvKind> {
        match code {
            1 => Some(TvKind::Simple),
            2 => Some(TvKind::Count),
            3 => Some(TvKind::Indefinite),
            4 => Some(TvKind::Probabilistic),
            _ => None,
        }
    }
}

/// Truth value metadata attached to every atom
///
/// A tagged triple. For Simple, Count and Probabilistic truth values the
/// fields mean what their names say. Indefinite truth values repurpose the
/// triple as (L, U, confidence-level); use the accessors for those.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TruthValue {
    pub kind: TvKind,
    pub mean: f64,
    pub confidence: f64,
    pub count: f64,
}

impl TruthValue {
    pub fn simple(mean: f64, confidence: f64) -> Self {
        TruthValue {
            kind: TvKind::Simple,
            mean,
            confidence,
            count: 0.0,
        }
    }

    pub fn count_tv(mean: f64, confidence: f64, count: f64) -> Self {
        TruthValue {
            kind: TvKind::Count,
            mean,
            confidence,
            count,
        }
    }

    pub fn indefinite(lower: f64, upper: f64, confidence_level: f64) -> Self {
        TruthValue {
            kind: TvKind::Indefinite,
            mean: lower,
            confidence: confidence_level,
            count: upper,
        }
    }

    pub fn probabilistic(mean: f64, confidence: f64, count: f64) -> Self {
        TruthValue {
            kind: TvKind::Probabilistic,
            mean,
            confidence,
            count,
        }
    }

    /// Lower bound of an indefinite truth value
    pub fn lower(&self) -> f64 {
        self.mean
    }

    /// Upper bound of an indefinite truth value
    pub fn upper(&self) -> f64 {
        self.count
    }

    pub fn confidence_level(&self) -> f64 {
        self.confidence
    }
}

impl Default for TruthValue {
    fn default() -> Self {
        TruthValue::simple(1.0, 0.0)
    }
}

/// Typed value payload stored by vuid
///
/// LinkValue composites own their children exclusively; deleting a parent
/// cascades into the referenced child rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Float(Vec<f64>),
    Str(Vec<String>),
    Link(Vec<Value>),
}

/// Wire code stored in the `type` column of Values and Valuations
pub const FLOAT_VALUE_CODE: i32 = 1;
pub const STRING_VALUE_CODE: i32 = 2;
pub const LINK_VALUE_CODE: i32 = 3;

impl Value {
    pub fn wire_code(&self) -> i32 {
        match self {
            Value::Float(_) => FLOAT_VALUE_CODE,
            Value::Str(_) => STRING_VALUE_CODE,
            Value::Link(_) => LINK_VALUE_CODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_sentinel() {
        assert!(!INVALID_UUID.is_valid());
        assert!(Uuid::new(1).is_valid());
    }

    #[test]
    fn test_tv_kind_roundtrip() {
        for kind in [
            TvKind::Simple,
            TvKind::Count,
            TvKind::Indefinite,
            TvKind::Probabilistic,
        ] {
            assert_eq!(TvKind::from_wire_code(kind.wire_code()), Some(kind));
        }
        assert_eq!(TvKind::from_wire_code(0), None);
        assert_eq!(TvKind::from_wire_code(99), None);
    }

    #[test]
    fn test_indefinite_accessors() {
        let tv = TruthValue::indefinite(0.2, 0.8, 0.9);
        assert_eq!(tv.lower(), 0.2);
        assert_eq!(tv.upper(), 0.8);
        assert_eq!(tv.confidence_level(), 0.9);
    }
}
