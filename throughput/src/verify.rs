use crate::buffers::HostBuffer;
use crate::element::{Element, ScalarValue};
use crate::VerificationOutcome;

/// Compare a backend's output against the serial reference.
///
/// Floating point elements match when `|computed - reference| < tolerance`,
/// integer elements only when equal. If the lengths differ the surplus
/// positions count as compared but unmatched.
pub fn verify(computed: &HostBuffer, reference: &HostBuffer, tolerance: f64) -> VerificationOutcome {
    match (computed, reference) {
        (HostBuffer::F32(c), HostBuffer::F32(r)) => verify_slices(c, r, tolerance),
        (HostBuffer::I32(c), HostBuffer::I32(r)) => verify_slices(c, r, tolerance),
        _ => VerificationOutcome {
            compared: computed.len().max(reference.len()),
            matched: 0,
            tolerance,
        },
    }
}

pub fn verify_slices<T: Element>(computed: &[T], reference: &[T], tolerance: f64) -> VerificationOutcome {
    let matched = computed
        .iter()
        .zip(reference.iter())
        .filter(|(&c, &r)| T::matches(c, r, tolerance))
        .count();
    VerificationOutcome {
        compared: computed.len().max(reference.len()),
        matched,
        tolerance,
    }
}

pub fn verify_scalar(computed: ScalarValue, reference: ScalarValue, tolerance: f64) -> VerificationOutcome {
    let ok = match (computed, reference) {
        (ScalarValue::Int(c), ScalarValue::Int(r)) => c == r,
        (c, r) => {
            let (c, r) = (c.as_f64(), r.as_f64());
            !c.is_nan() && !r.is_nan() && (c - r).abs() < tolerance
        }
    };
    VerificationOutcome {
        compared: 1,
        matched: ok as usize,
        tolerance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffers_fully_verified() {
        let out = verify(&HostBuffer::F32(vec![]), &HostBuffer::F32(vec![]), 1e-3);
        assert_eq!((out.matched, out.compared), (0, 0));
        assert!(out.is_verified());
    }

    #[test]
    fn test_counts_mismatches() {
        let out = verify(
            &HostBuffer::F32(vec![1.0, 2.0, 3.5]),
            &HostBuffer::F32(vec![1.0, 2.0005, 3.0]),
            1e-3,
        );
        assert_eq!((out.matched, out.compared), (2, 3));
        assert!(!out.is_verified());
    }

    #[test]
    fn test_integers_need_exact_match() {
        let out = verify(&HostBuffer::I32(vec![5, 6]), &HostBuffer::I32(vec![5, 7]), 10.0);
        assert_eq!(out.matched, 1);
    }

    #[test]
    fn test_length_difference_counts_as_unmatched() {
        let out = verify(&HostBuffer::I32(vec![1, 2]), &HostBuffer::I32(vec![1, 2, 3]), 0.0);
        assert_eq!((out.matched, out.compared), (2, 3));
    }

    #[test]
    fn test_dtype_difference_matches_nothing() {
        let out = verify(&HostBuffer::I32(vec![1]), &HostBuffer::F32(vec![1.0]), 1.0);
        assert_eq!((out.matched, out.compared), (0, 1));
    }

    #[test]
    fn test_scalar_sums() {
        assert!(verify_scalar(ScalarValue::Int(1_000_000), ScalarValue::Int(1_000_000), 0.0).is_verified());
        assert!(!verify_scalar(ScalarValue::Int(999_999), ScalarValue::Int(1_000_000), 5.0).is_verified());
        assert!(verify_scalar(ScalarValue::Float(10.0004), ScalarValue::Float(10.0), 1e-3).is_verified());
    }
}
