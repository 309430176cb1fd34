//! Threshold agglomeration.
//!
//! Start with every vector in its own group and repeatedly merge the most
//! similar pair of groups until no pair reaches the threshold. Group
//! similarity is average linkage: the mean cosine similarity over all
//! cross-group member pairs.
//!
//! For unit vectors the mean cross similarity of groups A and B equals
//! `sum(A) · sum(B) / (|A| |B|)`, so each group carries only its member sum.
//! The merged linkage `L(A∪B, X)` is the size-weighted mean of `L(A, X)` and
//! `L(B, X)`, so it can only reach the threshold when one of them already
//! did. Only above-threshold pairs are kept as merge candidates.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

use crate::embedding::l2_normalize;

/// A group of input indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Indices into the input slice, ascending.
    pub members: Vec<usize>,
    /// Mean pairwise cosine similarity of the members (1.0 for singletons).
    pub cohesion: f32,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Stable seam for swapping the clustering method.
pub trait Clusterer: Send + Sync {
    /// Partition `vectors` so every input index appears in exactly one cluster.
    fn cluster(&self, vectors: &[Vec<f32>], threshold: f32) -> Vec<Cluster>;
}

/// Average-linkage threshold agglomeration.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThresholdAgglomeration;

/// Cluster with [`ThresholdAgglomeration`].
pub fn cluster(vectors: &[Vec<f32>], threshold: f32) -> Vec<Cluster> {
    ThresholdAgglomeration.cluster(vectors, threshold)
}

struct Group {
    members: Vec<usize>,
    sum: Vec<f32>,
    /// Sum of squared member norms (members are 1.0 unless zero vectors).
    self_norms: f32,
    neighbors: BTreeSet<usize>,
}

struct Candidate {
    similarity: f32,
    a: usize,
    b: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Highest similarity first; ties go to the lowest group ids.
    fn cmp(&self, other: &Self) -> Ordering {
        self.similarity
            .total_cmp(&other.similarity)
            .then_with(|| other.a.cmp(&self.a))
            .then_with(|| other.b.cmp(&self.b))
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn linkage(a: &Group, b: &Group) -> f32 {
    dot(&a.sum, &b.sum) / (a.members.len() * b.members.len()) as f32
}

fn cohesion(g: &Group) -> f32 {
    let n = g.members.len();
    if n < 2 {
        return 1.0;
    }
    (dot(&g.sum, &g.sum) - g.self_norms) / (n * (n - 1)) as f32
}

impl Clusterer for ThresholdAgglomeration {
    fn cluster(&self, vectors: &[Vec<f32>], threshold: f32) -> Vec<Cluster> {
        let mut groups: Vec<Option<Group>> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut unit = v.clone();
                l2_normalize(&mut unit);
                let self_norms = dot(&unit, &unit);
                Some(Group {
                    members: vec![i],
                    sum: unit,
                    self_norms,
                    neighbors: BTreeSet::new(),
                })
            })
            .collect();

        let mut heap = BinaryHeap::new();
        for i in 0..groups.len() {
            for j in (i + 1)..groups.len() {
                let (Some(a), Some(b)) = (&groups[i], &groups[j]) else { continue };
                let similarity = linkage(a, b);
                if similarity >= threshold {
                    heap.push(Candidate { similarity, a: i, b: j });
                    if let Some(g) = groups[i].as_mut() {
                        g.neighbors.insert(j);
                    }
                    if let Some(g) = groups[j].as_mut() {
                        g.neighbors.insert(i);
                    }
                }
            }
        }

        while let Some(Candidate { a, b, .. }) = heap.pop() {
            // Stale candidate: one side was already merged away.
            if groups[a].is_none() || groups[b].is_none() {
                continue;
            }
            let (Some(ga), Some(gb)) = (groups[a].take(), groups[b].take()) else { continue };

            let mut members = ga.members;
            members.extend(gb.members);
            let sum: Vec<f32> = ga.sum.iter().zip(&gb.sum).map(|(x, y)| x + y).collect();
            let candidates: BTreeSet<usize> = ga
                .neighbors
                .union(&gb.neighbors)
                .copied()
                .filter(|&x| x != a && x != b)
                .collect();

            let merged = Group {
                members,
                sum,
                self_norms: ga.self_norms + gb.self_norms,
                neighbors: BTreeSet::new(),
            };
            let id = groups.len();
            groups.push(Some(merged));

            for x in candidates {
                let similarity = match (&groups[id], &groups[x]) {
                    (Some(m), Some(other)) => linkage(m, other),
                    _ => continue,
                };
                if let Some(other) = groups[x].as_mut() {
                    other.neighbors.remove(&a);
                    other.neighbors.remove(&b);
                }
                if similarity >= threshold {
                    heap.push(Candidate { similarity, a: x.min(id), b: x.max(id) });
                    if let Some(other) = groups[x].as_mut() {
                        other.neighbors.insert(id);
                    }
                    if let Some(m) = groups[id].as_mut() {
                        m.neighbors.insert(x);
                    }
                }
            }
        }

        let mut clusters: Vec<Cluster> = groups
            .into_iter()
            .flatten()
            .map(|g| {
                let cohesion = cohesion(&g);
                let mut members = g.members;
                members.sort_unstable();
                Cluster { members, cohesion }
            })
            .collect();
        clusters.sort_by(|x, y| y.len().cmp(&x.len()).then_with(|| x.members.cmp(&y.members)));
        clusters
    }
}

/// Mean pairwise cosine similarity of a set of vectors (1.0 for fewer than two).
pub fn mean_pairwise_similarity(vectors: &[&[f32]]) -> f32 {
    let Some(first) = vectors.first() else {
        return 1.0;
    };
    let mut group = Group {
        members: Vec::with_capacity(vectors.len()),
        sum: vec![0.0; first.len()],
        self_norms: 0.0,
        neighbors: BTreeSet::new(),
    };
    for (i, v) in vectors.iter().enumerate() {
        let mut unit = v.to_vec();
        l2_normalize(&mut unit);
        group.self_norms += dot(&unit, &unit);
        for (acc, x) in group.sum.iter_mut().zip(&unit) {
            *acc += x;
        }
        group.members.push(i);
    }
    cohesion(&group)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(angle_deg: f32) -> Vec<f32> {
        let r = angle_deg.to_radians();
        vec![r.cos(), r.sin()]
    }

    fn spike(i: usize, dim: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    #[test]
    fn every_index_lands_in_exactly_one_cluster() {
        let vectors: Vec<Vec<f32>> = (0..12).map(|i| unit(i as f32 * 9.0)).collect();
        let clusters = cluster(&vectors, 0.9);
        let mut seen: Vec<usize> = clusters.iter().flat_map(|c| c.members.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn separates_two_tight_groups() {
        let mut vectors = Vec::new();
        for i in 0..4 {
            vectors.push(unit(i as f32)); // near 0°
        }
        for i in 0..3 {
            vectors.push(unit(90.0 + i as f32)); // near 90°
        }
        vectors.push(unit(45.0)); // cos(45°) ≈ 0.707 to both groups

        let clusters = cluster(&vectors, 0.8);
        assert_eq!(clusters[0].members, vec![0, 1, 2, 3]);
        assert_eq!(clusters[1].members, vec![4, 5, 6]);
        assert_eq!(clusters[2].members, vec![7]);
        assert!(clusters[0].cohesion > 0.99);
        assert_eq!(clusters[2].cohesion, 1.0);
    }

    #[test]
    fn orthogonal_vectors_never_merge() {
        let vectors: Vec<Vec<f32>> = (0..5).map(|i| spike(i, 5)).collect();
        let clusters = cluster(&vectors, 0.1);
        assert_eq!(clusters.len(), 5);
        assert!(clusters.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn average_linkage_blocks_chaining() {
        // 0°, 30°, 60°, 90°: neighbours are 0.866 apart, ends are 0.
        let vectors: Vec<Vec<f32>> = [0.0, 30.0, 60.0, 90.0].iter().map(|a| unit(*a)).collect();
        let clusters = cluster(&vectors, 0.85);
        assert!(clusters.iter().all(|c| c.len() <= 2));
    }

    #[test]
    fn cohesion_is_mean_pairwise_similarity() {
        let vectors = vec![unit(0.0), unit(60.0), unit(30.0)];
        let clusters = cluster(&vectors, 0.5);
        assert_eq!(clusters.len(), 1);
        // pairs: cos60=0.5, cos30≈0.866, cos30≈0.866
        let expected = (0.5 + 0.866_025 * 2.0) / 3.0;
        assert!((clusters[0].cohesion - expected).abs() < 1e-4);
    }

    #[test]
    fn mean_pairwise_similarity_matches_cluster_cohesion() {
        let vectors = [unit(0.0), unit(60.0), unit(30.0)];
        let refs: Vec<&[f32]> = vectors.iter().map(|v| v.as_slice()).collect();
        let expected = (0.5 + 0.866_025 * 2.0) / 3.0;
        assert!((mean_pairwise_similarity(&refs) - expected).abs() < 1e-4);
        assert_eq!(mean_pairwise_similarity(&refs[..1]), 1.0);
    }

    #[test]
    fn empty_input_yields_no_clusters() {
        assert!(cluster(&[], 0.7).is_empty());
    }

    #[test]
    fn output_is_deterministic() {
        let vectors: Vec<Vec<f32>> = (0..20).map(|i| unit((i * 7 % 40) as f32)).collect();
        assert_eq!(cluster(&vectors, 0.95), cluster(&vectors, 0.95));
    }
}
