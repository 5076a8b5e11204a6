//! Vector math for cosine similarity.

/// Errors for vectors that cannot enter the database.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VectorError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector contains a non-finite value at position {0}")]
    NonFinite(usize),
}

/// Check length and finiteness of a vector.
pub fn validate(vector: &[f32], dimensions: usize) -> Result<(), VectorError> {
    if vector.len() != dimensions {
        return Err(VectorError::DimensionMismatch {
            expected: dimensions,
            got: vector.len(),
        });
    }

    if let Some(position) = vector.iter().position(|x| !x.is_finite()) {
        return Err(VectorError::NonFinite(position));
    }

    Ok(())
}

/// L2 norm, accumulated in f64.
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

/// Whether a vector with this norm cannot be ranked.
///
/// Squares of f32 values neither underflow nor overflow in f64, so only an
/// all-zero vector lands here.
pub fn is_zero_norm(norm: f64) -> bool {
    !(norm.is_finite() && norm > 0.0)
}

pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

/// Cosine similarity with precomputed norms, clamped to `[-1, 1]`.
pub fn cosine_with_norms(a: &[f32], a_norm: f64, b: &[f32], b_norm: f64) -> f32 {
    (dot(a, b) / (a_norm * b_norm)).clamp(-1.0, 1.0) as f32
}

/// Cosine similarity `dot(a,b) / (|a| * |b|)`.
///
/// Returns `None` when either vector has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }

    let a_norm = l2_norm(a);
    let b_norm = l2_norm(b);
    if is_zero_norm(a_norm) || is_zero_norm(b_norm) {
        return None;
    }

    Some(cosine_with_norms(a, a_norm, b, b_norm))
}
