//! Float comparison helpers for tests.

use ndarray::ArrayD;

/// Default relative tolerance, matching the common numpy `allclose` value.
pub const DEFAULT_RTOL: f64 = 1e-5;
/// Default absolute tolerance, matching the common numpy `allclose` value.
pub const DEFAULT_ATOL: f64 = 1e-8;

/// Panics unless `actual` and `expected` agree elementwise within
/// `|a - b| <= atol + rtol * |b|`.
///
/// Shapes must match exactly; the first offending flat index is reported.
pub fn assert_allclose_tol(actual: &ArrayD<f32>, expected: &ArrayD<f32>, rtol: f64, atol: f64) {
    assert_eq!(
        actual.shape(),
        expected.shape(),
        "shape mismatch: {:?} vs {:?}",
        actual.shape(),
        expected.shape(),
    );
    for (i, (&a, &b)) in actual.iter().zip(expected.iter()).enumerate() {
        let (a, b) = (a as f64, b as f64);
        let tol = atol + rtol * b.abs();
        assert!(
            (a - b).abs() <= tol,
            "values differ at flat index {i}: {a} vs {b} (tolerance {tol})"
        );
    }
}

/// [`assert_allclose_tol`] with the default tolerances.
pub fn assert_allclose(actual: &ArrayD<f32>, expected: &ArrayD<f32>) {
    assert_allclose_tol(actual, expected, DEFAULT_RTOL, DEFAULT_ATOL);
}
