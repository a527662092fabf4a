//! In-memory retrieval over one encoder's rows: exact linear scan for
//! small catalogs, IVF-flat coarse quantization above the configured
//! threshold. Both paths assume unit-norm vectors and rank by inner
//! product, which equals cosine similarity there.

use crate::encoder::types::cosine_similarity;
use log::debug;

/// One visible image row loaded for search.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub image_id: i64,
    pub disc_id: i64,
    pub embedding: Vec<f32>,
}

/// A scored row returned by `top_k`.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub image_id: i64,
    pub disc_id: i64,
    pub similarity: f32,
}

/// Sorts by similarity descending, then by lower image id, and truncates.
fn rank(mut hits: Vec<Hit>, k: usize) -> Vec<Hit> {
    hits.sort_unstable_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.image_id.cmp(&b.image_id))
    });
    hits.truncate(k);
    hits
}

fn score(entries: &[IndexEntry], query: &[f32], min_similarity: f32) -> Vec<Hit> {
    entries
        .iter()
        .filter_map(|e| {
            let similarity = cosine_similarity(&e.embedding, query);
            (similarity.is_finite() && similarity >= min_similarity).then(|| Hit {
                image_id: e.image_id,
                disc_id: e.disc_id,
                similarity,
            })
        })
        .collect()
}

/// Exact top-k by brute-force scan.
pub fn top_k_linear(entries: &[IndexEntry], query: &[f32], k: usize, min_similarity: f32) -> Vec<Hit> {
    rank(score(entries, query, min_similarity), k)
}

/// IVF-flat: k-means coarse centroids over the rows, queries probe the
/// nearest `nprobe` lists. Recall loss is tolerated; callers oversample
/// before aggregation.
pub struct IvfIndex {
    dimension: usize,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<IndexEntry>>,
}

impl IvfIndex {
    pub fn build(entries: Vec<IndexEntry>, nlist: usize, dimension: usize) -> Self {
        if entries.is_empty() {
            return Self { dimension, centroids: Vec::new(), lists: Vec::new() };
        }
        let nlist = nlist.clamp(1, entries.len());
        let mut centroids: Vec<Vec<f32>> = (0..nlist)
            // Deterministic stride seeding keeps rebuilds stable.
            .map(|i| entries[i * entries.len() / nlist].embedding.clone())
            .collect();

        let mut assignment = vec![0usize; entries.len()];
        for _ in 0..10 {
            let mut changed = false;
            for (i, entry) in entries.iter().enumerate() {
                let best = nearest_centroid(&centroids, &entry.embedding);
                if assignment[i] != best {
                    assignment[i] = best;
                    changed = true;
                }
            }
            let mut sums = vec![vec![0f32; dimension]; nlist];
            let mut counts = vec![0usize; nlist];
            for (i, entry) in entries.iter().enumerate() {
                counts[assignment[i]] += 1;
                for (s, v) in sums[assignment[i]].iter_mut().zip(&entry.embedding) {
                    *s += v;
                }
            }
            for (c, (sum, count)) in centroids.iter_mut().zip(sums.into_iter().zip(counts)) {
                if count > 0 {
                    let norm: f32 = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
                    if norm > 0.0 {
                        *c = sum.into_iter().map(|v| v / norm).collect();
                    }
                }
            }
            if !changed {
                break;
            }
        }

        let mut lists: Vec<Vec<IndexEntry>> = vec![Vec::new(); nlist];
        for (i, entry) in entries.into_iter().enumerate() {
            lists[assignment[i]].push(entry);
        }
        debug!("IVF index built: {} lists over {} rows", nlist, assignment.len());
        Self { dimension, centroids, lists }
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn search(&self, query: &[f32], k: usize, min_similarity: f32, nprobe: usize) -> Vec<Hit> {
        let mut ranked: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, cosine_similarity(c, query)))
            .collect();
        ranked.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut hits = Vec::new();
        for &(list, _) in ranked.iter().take(nprobe.max(1)) {
            hits.extend(score(&self.lists[list], query, min_similarity));
        }
        rank(hits, k)
    }
}

fn nearest_centroid(centroids: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_sim = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let sim = cosine_similarity(c, v);
        if sim > best_sim {
            best_sim = sim;
            best = i;
        }
    }
    best
}
