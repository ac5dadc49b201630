//! Cache-key fingerprinting for `(artifact_id, kwargs)` invocations.
//!
//! Mirrors the source's `_make_key`: scalar-ish argument types (`int`, `str`,
//! `bool`, `float`, `set`, `tuple`) are folded into the key by value; every
//! other type is folded in by object identity, since structural equality for
//! arbitrary rich objects is either undefined or too expensive to use as a
//! cache key.

use crate::vm::PyValue;

/// One component of a fingerprint: either a scalar value or the identity of
/// a rich object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum FpAtom {
    None,
    Bool(bool),
    Int(i64),
    /// `f64::to_bits()` so floats are hashable/orderable without `NaN` woes.
    Float(u64),
    Str(String),
    Tuple(Vec<FpAtom>),
    Set(Vec<FpAtom>),
    /// Stable object handle (RustPython's `get_id()`) for anything else.
    Identity(usize),
}

/// Hashable identity for a single top-level or nested artifact invocation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<(String, FpAtom)>);

impl Fingerprint {
    /// Builds a fingerprint for `object_id` called with `kwargs`, preserving
    /// the caller's argument order (order affects the fingerprint, matching
    /// the source's tuple-of-dict-items hashing).
    pub fn new(object_id: &str, kwargs: &[(String, PyValue)]) -> Self {
        let mut atoms = Vec::with_capacity(kwargs.len() + 1);
        atoms.push((String::from("\0object_id"), FpAtom::Str(object_id.to_string())));
        for (k, v) in kwargs {
            atoms.push((k.clone(), classify(v)));
        }
        Fingerprint(atoms)
    }

    #[cfg(test)]
    pub fn from_raw(n: u64) -> Self {
        Fingerprint(vec![(String::from("\0raw"), FpAtom::Int(n as i64))])
    }
}

fn classify(v: &PyValue) -> FpAtom {
    match v {
        PyValue::None => FpAtom::None,
        PyValue::Bool(b) => FpAtom::Bool(*b),
        PyValue::Int(i) => FpAtom::Int(*i),
        PyValue::Float(f) => FpAtom::Float(f.to_bits()),
        PyValue::Str(s) => FpAtom::Str(s.clone()),
        PyValue::Tuple(items) => FpAtom::Tuple(items.iter().map(classify).collect()),
        PyValue::Set(items) => {
            let mut atoms: Vec<FpAtom> = items.iter().map(classify).collect();
            atoms.sort();
            FpAtom::Set(atoms)
        }
        PyValue::Object(obj) => FpAtom::Identity(obj.get_id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_scalar_kwargs_produce_equal_fingerprints() {
        let a = Fingerprint::new("inc", &[("x".into(), PyValue::Int(1))]);
        let b = Fingerprint::new("inc", &[("x".into(), PyValue::Int(1))]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_object_id_changes_fingerprint() {
        let a = Fingerprint::new("inc", &[("x".into(), PyValue::Int(1))]);
        let b = Fingerprint::new("dec", &[("x".into(), PyValue::Int(1))]);
        assert_ne!(a, b);
    }

    #[test]
    fn different_kwarg_order_changes_fingerprint() {
        let a = Fingerprint::new(
            "f",
            &[("x".into(), PyValue::Int(1)), ("y".into(), PyValue::Int(2))],
        );
        let b = Fingerprint::new(
            "f",
            &[("y".into(), PyValue::Int(2)), ("x".into(), PyValue::Int(1))],
        );
        assert_ne!(a, b);
    }
}
