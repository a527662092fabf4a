//! The embedding contract every backend satisfies.

use crate::{MatchError, Result};
use image::RgbImage;

/// Physical width of every stored vector. Backends with a smaller native
/// dimension are right-zero-padded up to this; cosine similarity is
/// invariant under that padding.
pub const EMBEDDING_WIDTH: usize = 1024;

/// A unit-norm feature vector in a backend's native dimension.
///
/// A backend that produces a zero-norm raw vector yields a canonical zero
/// embedding instead; callers must treat that as unusable and refuse to
/// persist it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Normalizes a raw backend output to unit length. A zero-norm input
    /// becomes the canonical zero vector.
    pub fn from_raw(raw: Vec<f32>) -> Self {
        let norm: f32 = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            Embedding { values: raw.iter().map(|v| v / norm).collect() }
        } else {
            Embedding { values: vec![0.0; raw.len()] }
        }
    }

    /// Wraps values that are already unit-norm (or deliberately zero).
    pub fn from_normalized(values: Vec<f32>) -> Self {
        Embedding { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True for the canonical zero vector; such embeddings are never stored.
    pub fn is_degenerate(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// Right-zero-pads to the store's physical width.
    pub fn padded(&self, width: usize) -> Result<Vec<f32>> {
        if self.values.len() > width {
            return Err(MatchError::InvalidDimension {
                expected: width,
                actual: self.values.len(),
            });
        }
        let mut out = self.values.clone();
        out.resize(width, 0.0);
        Ok(out)
    }
}

/// Inner product of two same-length vectors; equals cosine similarity when
/// both are unit norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// A swappable embedding backend. `embed` must be deterministic for a
/// fixed input and safe to call from concurrent request handlers.
pub trait ImageEncoder: Send + Sync {
    /// Stable short label recorded next to every stored embedding.
    fn name(&self) -> &str;
    /// Native output dimension.
    fn dimension(&self) -> usize;
    /// Produces an L2-normalized vector of length `dimension()`.
    fn embed(&self, raster: &RgbImage) -> Result<Embedding>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_normalizes() {
        let e = Embedding::from_raw(vec![3.0, 4.0]);
        assert!((e.values()[0] - 0.6).abs() < 1e-6);
        assert!((e.values()[1] - 0.8).abs() < 1e-6);
        let norm: f32 = e.values().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn zero_raw_is_degenerate() {
        let e = Embedding::from_raw(vec![0.0; 8]);
        assert!(e.is_degenerate());
        assert_eq!(e.len(), 8);
    }

    #[test]
    fn padding_preserves_cosine() {
        let a = Embedding::from_raw(vec![1.0, 2.0, 3.0]);
        let b = Embedding::from_raw(vec![-2.0, 0.5, 1.0]);
        let native = cosine_similarity(a.values(), b.values());
        let padded = cosine_similarity(
            &a.padded(EMBEDDING_WIDTH).unwrap(),
            &b.padded(EMBEDDING_WIDTH).unwrap(),
        );
        assert!((native - padded).abs() < 1e-6);
    }

    #[test]
    fn padding_rejects_oversized() {
        let e = Embedding::from_raw(vec![1.0; 4]);
        assert!(matches!(e.padded(3), Err(MatchError::InvalidDimension { .. })));
    }

    #[test]
    fn self_similarity_is_one() {
        let e = Embedding::from_raw(vec![0.3, -0.1, 0.88, 0.2]);
        assert!((cosine_similarity(e.values(), e.values()) - 1.0).abs() < 1e-5);
    }
}
