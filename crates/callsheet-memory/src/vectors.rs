//! Embedding vector math used by dedup and consolidation.

/// Cosine similarity of two vectors; 0.0 for mismatched or zero-norm input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator <= f32::EPSILON {
        0.0
    } else {
        dot / denominator
    }
}

/// Mean pairwise cosine over a cluster; 1.0 for singleton clusters.
pub fn mean_pairwise_cosine(vectors: &[&[f32]]) -> f32 {
    if vectors.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0f32;
    let mut pairs = 0u32;
    for i in 0..vectors.len() {
        for j in (i + 1)..vectors.len() {
            total += cosine_similarity(vectors[i], vectors[j]);
            pairs += 1;
        }
    }
    total / pairs as f32
}

/// Unit-normalized centroid of a cluster.
pub fn normalized_centroid(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut centroid = vec![0.0f32; first.len()];
    for vector in vectors {
        for (sum, value) in centroid.iter_mut().zip(vector.iter()) {
            *sum += value;
        }
    }
    let count = vectors.len() as f32;
    centroid.iter_mut().for_each(|v| *v /= count);
    let norm = centroid.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        centroid.iter_mut().for_each(|v| *v /= norm);
    }
    centroid
}

/// Greedy single-pass clustering by similarity to the cluster centroid.
/// Returns index clusters that meet both the cohesion threshold (mean
/// pairwise cosine) and the minimum size.
pub fn cluster_by_cohesion(
    vectors: &[Vec<f32>],
    cohesion_threshold: f32,
    min_cluster_size: usize,
) -> Vec<Vec<usize>> {
    let mut assigned = vec![false; vectors.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for seed in 0..vectors.len() {
        if assigned[seed] {
            continue;
        }
        let mut members = vec![seed];
        for candidate in (seed + 1)..vectors.len() {
            if assigned[candidate] {
                continue;
            }
            let refs: Vec<&[f32]> = members.iter().map(|&i| vectors[i].as_slice()).collect();
            let centroid = normalized_centroid(&refs);
            if cosine_similarity(&centroid, &vectors[candidate]) >= cohesion_threshold {
                members.push(candidate);
            }
        }

        let refs: Vec<&[f32]> = members.iter().map(|&i| vectors[i].as_slice()).collect();
        if members.len() >= min_cluster_size && mean_pairwise_cosine(&refs) >= cohesion_threshold {
            for &member in &members {
                assigned[member] = true;
            }
            clusters.push(members);
        }
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(values: &[f32]) -> Vec<f32> {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        values.iter().map(|v| v / norm).collect()
    }

    #[test]
    fn cosine_basics() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &a), 1.0);
        assert_eq!(cosine_similarity(&a, &b), 0.0);
        assert_eq!(cosine_similarity(&a, &[-1.0, 0.0, 0.0]), -1.0);
    }

    #[test]
    fn cosine_guards_degenerate_input() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn mean_pairwise_of_identical_vectors_is_one() {
        let v = unit(&[0.3, 0.4, 0.5]);
        let refs: Vec<&[f32]> = vec![&v, &v, &v];
        assert!((mean_pairwise_cosine(&refs) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn centroid_is_unit_norm() {
        let a = unit(&[1.0, 0.0]);
        let b = unit(&[0.8, 0.2]);
        let refs: Vec<&[f32]> = vec![&a, &b];
        let centroid = normalized_centroid(&refs);
        let norm: f32 = centroid.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn clustering_separates_distinct_topics() {
        // three near-identical vectors plus two outliers on another axis
        let vectors = vec![
            unit(&[1.0, 0.01, 0.0]),
            unit(&[1.0, 0.02, 0.0]),
            unit(&[1.0, 0.00, 0.01]),
            unit(&[0.0, 1.0, 0.0]),
            unit(&[0.0, 0.99, 0.05]),
        ];
        let clusters = cluster_by_cohesion(&vectors, 0.85, 3);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0], vec![0, 1, 2]);
    }

    #[test]
    fn undersized_clusters_are_dropped() {
        let vectors = vec![unit(&[1.0, 0.0]), unit(&[0.99, 0.01])];
        assert!(cluster_by_cohesion(&vectors, 0.85, 3).is_empty());
    }

    #[test]
    fn loose_clusters_fail_cohesion() {
        let vectors = vec![
            unit(&[1.0, 0.0, 0.0]),
            unit(&[0.7, 0.7, 0.0]),
            unit(&[0.7, 0.0, 0.7]),
        ];
        assert!(cluster_by_cohesion(&vectors, 0.95, 3).is_empty());
    }
}
