// ============================================================================
// spark-reactor - Equality Functions
// Stock predicates for sources and deriveds
// ============================================================================
//
// An equality predicate decides whether a write (or a recompute) counts as a
// change. Equal means no new write version and no propagation.
// ============================================================================

use crate::core::types::EqualsFn;

/// Strict equality through `PartialEq`. The default everywhere.
///
/// ```
/// use spark_reactor::equality::equals;
///
/// assert!(equals(&42, &42));
/// assert!(!equals(&"a", &"b"));
/// ```
pub fn equals<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

/// f64 equality that treats NaN as equal to NaN.
///
/// Plain `PartialEq` would make a source holding NaN report a change on
/// every write of NaN.
///
/// ```
/// use spark_reactor::equality::safe_equals_f64;
///
/// assert!(safe_equals_f64(&f64::NAN, &f64::NAN));
/// assert!(!safe_equals_f64(&f64::NAN, &1.0));
/// ```
pub fn safe_equals_f64(a: &f64, b: &f64) -> bool {
    if a.is_nan() {
        return b.is_nan();
    }
    a == b
}

pub fn safe_equals_f32(a: &f32, b: &f32) -> bool {
    if a.is_nan() {
        return b.is_nan();
    }
    a == b
}

pub fn safe_equals_option_f64(a: &Option<f64>, b: &Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => safe_equals_f64(a, b),
        _ => false,
    }
}

/// Every write is a change.
pub fn never_equals<T>(_a: &T, _b: &T) -> bool {
    false
}

/// No write is ever a change.
pub fn always_equals<T>(_a: &T, _b: &T) -> bool {
    true
}

/// `equals` as an `EqualsFn`, for places that need the pointer type spelled out.
pub fn default_equals_fn<T: PartialEq + 'static>() -> EqualsFn<T> {
    equals
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_equality() {
        assert!(equals(&42, &42));
        assert!(!equals(&42, &43));
        assert!(equals(&vec![1, 2], &vec![1, 2]));
    }

    #[test]
    fn nan_aware_floats() {
        assert!(safe_equals_f64(&1.0, &1.0));
        assert!(safe_equals_f64(&-0.0, &0.0));
        assert!(safe_equals_f64(&f64::NAN, &f64::NAN));
        assert!(!safe_equals_f64(&1.0, &f64::NAN));
        assert!(!safe_equals_f64(&f64::INFINITY, &f64::NEG_INFINITY));

        assert!(safe_equals_f32(&f32::NAN, &f32::NAN));
        assert!(!safe_equals_f32(&f32::NAN, &1.0));

        assert!(safe_equals_option_f64(&Some(f64::NAN), &Some(f64::NAN)));
        assert!(safe_equals_option_f64(&None, &None));
        assert!(!safe_equals_option_f64(&Some(1.0), &None));
    }

    #[test]
    fn constant_predicates() {
        assert!(!never_equals(&"same", &"same"));
        assert!(always_equals(&1, &2));

        let eq: EqualsFn<i32> = default_equals_fn();
        assert!(eq(&3, &3));
    }

    #[test]
    fn nan_source_does_not_churn() {
        let rt = crate::runtime::Runtime::new();
        let plain = rt.source(f64::NAN);
        let safe = rt.source_with_equals(f64::NAN, safe_equals_f64);

        assert!(plain.set(f64::NAN));
        assert!(!safe.set(f64::NAN));
    }
}
