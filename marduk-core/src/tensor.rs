//! Small vector helpers backing similarity computations.

/// Dot product of two equal-length vectors.
///
/// Mismatched lengths yield 0.0 so callers can treat the pair as unrelated.
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Euclidean magnitude of a vector.
#[must_use]
pub fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale a vector in place by a constant factor.
pub fn scale(v: &mut [f32], factor: f32) {
    for x in v.iter_mut() {
        *x *= factor;
    }
}

/// Normalize a vector to unit magnitude. Zero vectors are left unchanged.
pub fn normalize(v: &mut [f32]) {
    let mag = magnitude(v);
    if mag > 0.0 {
        scale(v, 1.0 / mag);
    }
}

/// Element-wise mean of a set of equal-length vectors.
///
/// Returns an empty vector when the input is empty or dimensions disagree.
#[must_use]
pub fn mean(vectors: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let dim = first.len();
    if vectors.iter().any(|v| v.len() != dim) {
        return Vec::new();
    }

    let mut out = vec![0.0; dim];
    for v in vectors {
        for (acc, x) in out.iter_mut().zip(v.iter()) {
            *acc += x;
        }
    }
    let count = vectors.len() as f32;
    for acc in &mut out {
        *acc /= count;
    }
    out
}

/// Check that every component is finite.
#[must_use]
pub fn is_finite(v: &[f32]) -> bool {
    v.iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_known_values() {
        assert_eq!(dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
        assert_eq!(dot(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn test_magnitude() {
        assert!((magnitude(&[3.0, 4.0]) - 5.0).abs() < 1e-6);
        assert_eq!(magnitude(&[]), 0.0);
    }

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((magnitude(&v) - 1.0).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_mean() {
        let vectors = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        assert_eq!(mean(&vectors), vec![2.0, 3.0]);

        let mismatched = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(mean(&mismatched).is_empty());
        assert!(mean(&[]).is_empty());
    }

    #[test]
    fn test_is_finite() {
        assert!(is_finite(&[1.0, 2.0]));
        assert!(!is_finite(&[1.0, f32::NAN]));
    }
}
