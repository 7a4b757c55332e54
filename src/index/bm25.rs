//! Okapi BM25 scoring

/// Term-frequency saturation parameter
pub const K1: f64 = 1.2;
/// Length-normalization parameter
pub const B: f64 = 0.75;

/// Inverse document frequency with the standard +0.5 smoothing
pub fn idf(doc_count: u64, doc_freq: u64) -> f64 {
    let n = doc_count as f64;
    let df = doc_freq as f64;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
}

/// BM25 contribution of one term in one document
pub fn term_score(tf: u32, doc_len: u32, avg_doc_len: f64, doc_count: u64, doc_freq: u64) -> f64 {
    if tf == 0 || doc_count == 0 {
        return 0.0;
    }
    let tf = f64::from(tf);
    let len_norm = 1.0 - B + B * f64::from(doc_len) / avg_doc_len.max(1.0);
    idf(doc_count, doc_freq) * (tf * (K1 + 1.0)) / (tf + K1 * len_norm)
}

/// Min-max normalize raw scores to [0, 1] per query
pub fn normalize(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::MIN, f64::max);
    let min = scores.iter().copied().fold(f64::MAX, f64::min);
    if scores.is_empty() || (max - min).abs() < f64::EPSILON {
        return scores.iter().map(|_| 1.0).collect();
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}
