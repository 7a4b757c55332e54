//! Optional vector search capability
//!
//! Embedding-based retrieval is a pluggable capability: when an
//! implementation is registered, ranking applies a reciprocal-rank
//! fusion pass over its results; when absent, everything works with
//! keyword recall only.

use std::sync::Arc;

/// A nearest-neighbor hit from the vector side
#[derive(Debug, Clone, PartialEq)]
pub struct AnnHit {
    pub doc_id: u64,
    pub distance: f32,
}

/// The capability surface a vector backend must provide
pub trait VectorCapability: Send + Sync {
    /// Embed a text into the backend's vector space
    fn embed(&self, text: &str) -> Vec<f32>;
    /// K-nearest-neighbor search
    fn ann_search(&self, vector: &[f32], k: usize) -> Vec<AnnHit>;
}

/// Registry holding at most one vector backend
#[derive(Clone, Default)]
pub struct VectorRegistry {
    backend: Option<Arc<dyn VectorCapability>>,
}

impl VectorRegistry {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Arc<dyn VectorCapability>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Ranked doc ids for a query, best first; empty when no backend
    pub fn search(&self, query_text: &str, k: usize) -> Vec<u64> {
        let Some(backend) = &self.backend else {
            return Vec::new();
        };
        let vector = backend.embed(query_text);
        let mut hits = backend.ann_search(&vector, k);
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.into_iter().map(|h| h.doc_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBackend;

    impl VectorCapability for FakeBackend {
        fn embed(&self, text: &str) -> Vec<f32> {
            vec![text.len() as f32]
        }
        fn ann_search(&self, _vector: &[f32], k: usize) -> Vec<AnnHit> {
            (0..k as u64)
                .map(|i| AnnHit {
                    doc_id: i + 1,
                    distance: i as f32,
                })
                .collect()
        }
    }

    #[test]
    fn test_absent_backend_returns_empty() {
        let registry = VectorRegistry::none();
        assert!(!registry.is_available());
        assert!(registry.search("anything", 5).is_empty());
    }

    #[test]
    fn test_backend_results_ordered_by_distance() {
        let registry = VectorRegistry::with_backend(Arc::new(FakeBackend));
        assert!(registry.is_available());
        assert_eq!(registry.search("q", 3), vec![1, 2, 3]);
    }
}
