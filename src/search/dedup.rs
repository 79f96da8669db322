//! Near-duplicate removal by greedy single-pass clustering.
//!
//! For each row in ascending order, its nearest neighbors (at most
//! [`MAX_NEIGHBORS`]) at or above the threshold are marked removed unless the
//! row itself was already removed. The earliest row of a cluster survives.
//!
//! This is deliberately not a transitive closure. With A~B and B~C but
//! A≁C, B is removed by A before it gets to claim C, so C survives. Items
//! with more than [`MAX_NEIGHBORS`] near-duplicates can also keep some, and
//! past that cap a later row may claim an earlier survivor it finds in its
//! own neighbor list. Both are accepted residue, not errors.

use std::time::Instant;

use anyhow::{Result, bail};
use rayon::prelude::*;
use serde::Serialize;

use super::embedder::normalize_if_needed;
use super::vector_index::{VectorHit, VectorIndex};

/// Neighbor candidates examined per row.
pub const MAX_NEIGHBORS: usize = 100;

pub const DEFAULT_DEDUP_THRESHOLD: f32 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DedupReport {
    pub before: usize,
    pub after: usize,
    pub removed: usize,
    pub threshold: f32,
}

impl DedupReport {
    pub fn reduction_pct(&self) -> f64 {
        if self.before == 0 {
            return 0.0;
        }
        self.removed as f64 / self.before as f64 * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct Deduplicated {
    pub index: VectorIndex,
    pub identifiers: Vec<String>,
    pub removed: usize,
}

impl Deduplicated {
    pub fn report(&self, threshold: f32) -> DedupReport {
        DedupReport {
            before: self.identifiers.len() + self.removed,
            after: self.identifiers.len(),
            removed: self.removed,
            threshold,
        }
    }
}

pub fn validate_threshold(threshold: f32) -> Result<()> {
    if !(threshold > 0.0 && threshold < 1.0) {
        bail!("dedup threshold must be in (0, 1), got {threshold}");
    }
    Ok(())
}

/// Remove near-duplicates from `index`, keeping `identifiers` aligned.
/// Similarity `>= threshold` counts as a duplicate.
pub fn deduplicate(
    index: &VectorIndex,
    identifiers: &[String],
    threshold: f32,
) -> Result<Deduplicated> {
    validate_threshold(threshold)?;
    if index.len() != identifiers.len() {
        bail!(
            "index has {} vectors but {} identifiers were given",
            index.len(),
            identifiers.len()
        );
    }
    let start = Instant::now();
    let n = index.len();

    let mut vectors = index.reconstruct_all();
    let renormalized = vectors
        .iter_mut()
        .map(|v| normalize_if_needed(v))
        .filter(|changed| *changed)
        .count();
    if renormalized > 0 {
        tracing::debug!(renormalized, "re-normalized stored vectors before dedup");
    }
    let scratch = VectorIndex::build(index.embedder_id(), index.dimension(), &vectors)?;

    let k = MAX_NEIGHBORS.min(n);
    let neighbors: Vec<Vec<VectorHit>> = vectors
        .par_iter()
        .map(|v| scratch.search(v, k))
        .collect::<Result<_>>()?;

    let keep = greedy_keep_mask(&neighbors, threshold);

    let mut survivors = Vec::with_capacity(n);
    let mut kept_ids = Vec::with_capacity(n);
    for (row, vector) in vectors.into_iter().enumerate() {
        if keep[row] {
            survivors.push(vector);
            kept_ids.push(identifiers[row].clone());
        }
    }
    let removed = n - kept_ids.len();
    let deduped = VectorIndex::build(index.embedder_id(), index.dimension(), survivors)?;

    tracing::info!(
        before = n,
        after = kept_ids.len(),
        removed,
        threshold,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "deduplicated index"
    );
    Ok(Deduplicated {
        index: deduped,
        identifiers: kept_ids,
        removed,
    })
}

/// `neighbors[i]` holds row `i`'s top hits. Returns which rows survive.
fn greedy_keep_mask(neighbors: &[Vec<VectorHit>], threshold: f32) -> Vec<bool> {
    let n = neighbors.len();
    let mut keep = vec![true; n];
    let mut processed = vec![false; n];

    for (i, hits) in neighbors.iter().enumerate() {
        if !keep[i] || processed[i] {
            continue;
        }
        for hit in hits {
            let j = hit.row;
            if j != i && hit.score >= threshold && keep[j] {
                keep[j] = false;
                processed[j] = true;
            }
        }
        processed[i] = true;
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Unit vector in the xy-plane at the given cosine to the x axis.
    fn at_cosine(c: f32) -> Vec<f32> {
        vec![c, (1.0 - c * c).sqrt(), 0.0]
    }

    #[test]
    fn earliest_row_survives() -> Result<()> {
        // sim(A,B)=0.97, sim(A,C)=sim(B,C)=0.10.
        let a = vec![1.0, 0.0, 0.0];
        let b = at_cosine(0.97);
        let cy = (0.10 - 0.97 * 0.10) / b[1];
        let cz = (1.0 - 0.01 - cy * cy).sqrt();
        let c = vec![0.10, cy, cz];

        let index = VectorIndex::build("t", 3, vec![a.clone(), b, c.clone()])?;
        let out = deduplicate(&index, &ids(&["A", "B", "C"]), 0.95)?;
        assert_eq!(out.identifiers, ids(&["A", "C"]));
        assert_eq!(out.removed, 1);
        assert_eq!(out.index.reconstruct(0)?, a);
        assert_eq!(out.index.reconstruct(1)?, c);
        Ok(())
    }

    #[test]
    fn threshold_is_inclusive() -> Result<()> {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.6f32, 0.8];
        let index = VectorIndex::build("t", 2, vec![a, b])?;

        let at = deduplicate(&index, &ids(&["a", "b"]), 0.6)?;
        assert_eq!(at.identifiers, ids(&["a"]));

        let just_above = f32::from_bits(0.6f32.to_bits() + 1);
        let above = deduplicate(&index, &ids(&["a", "b"]), just_above)?;
        assert_eq!(above.identifiers, ids(&["a", "b"]));
        assert_eq!(above.removed, 0);
        Ok(())
    }

    #[test]
    fn chain_is_not_transitive() -> Result<()> {
        // A~B and B~C above 0.95, A~C below.
        let a = at_cosine(1.0);
        let b = at_cosine(0.96);
        let angle_b = 0.96f32.acos();
        let c = vec![(2.0 * angle_b).cos(), (2.0 * angle_b).sin(), 0.0];
        let index = VectorIndex::build("t", 3, vec![a, b, c])?;

        let out = deduplicate(&index, &ids(&["A", "B", "C"]), 0.95)?;
        assert_eq!(out.identifiers, ids(&["A", "C"]));
        Ok(())
    }

    #[test]
    fn exact_duplicates_collapse_to_first() -> Result<()> {
        let v = vec![0.0, 1.0, 0.0];
        let w = vec![1.0, 0.0, 0.0];
        let index = VectorIndex::build("t", 3, vec![w.clone(), v.clone(), v.clone(), w, v])?;
        let out = deduplicate(&index, &ids(&["w0", "v1", "v2", "w3", "v4"]), 0.99)?;
        assert_eq!(out.identifiers, ids(&["w0", "v1"]));
        let report = out.report(0.99);
        assert_eq!(report.before, 5);
        assert_eq!(report.after, 2);
        assert_eq!(report.removed, 3);
        assert!((report.reduction_pct() - 60.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn neighbor_cap_leaves_residual_duplicates() -> Result<()> {
        // 150 identical vectors: row 0 only sees 100 of them.
        let rows = vec![vec![1.0f32, 0.0]; MAX_NEIGHBORS + 50];
        let names: Vec<String> = (0..rows.len()).map(|i| i.to_string()).collect();
        let index = VectorIndex::build("t", 2, rows)?;
        let out = deduplicate(&index, &names, 0.95)?;
        // Ties resolve to the lowest rows: row 0 removes rows 1..=99. Row 100
        // never saw row 0 as a duplicate-holder, so its own top-100 (rows
        // 0..=99) claims row 0, and rows 100..150 see nothing left to remove.
        let expected: Vec<String> = (MAX_NEIGHBORS..names.len()).map(|i| i.to_string()).collect();
        assert_eq!(out.identifiers, expected);
        assert_eq!(out.removed, MAX_NEIGHBORS);
        Ok(())
    }

    #[test]
    fn monotone_and_aligned() -> Result<()> {
        let mut rows = Vec::new();
        let mut names = Vec::new();
        for i in 0..30 {
            let angle = (i % 7) as f32 * 0.4 + (i / 7) as f32 * 0.001;
            rows.push(vec![angle.cos(), angle.sin()]);
            names.push(format!("img{i}"));
        }
        let index = VectorIndex::build("t", 2, &rows)?;
        let out = deduplicate(&index, &names, 0.999)?;
        assert!(out.identifiers.len() <= names.len());
        assert_eq!(out.removed, names.len() - out.identifiers.len());
        for (row, id) in out.identifiers.iter().enumerate() {
            let original = names.iter().position(|n| n == id).unwrap();
            assert_eq!(out.index.reconstruct(row)?, rows[original]);
        }
        Ok(())
    }

    #[test]
    fn rejects_bad_inputs() -> Result<()> {
        let index = VectorIndex::build("t", 2, vec![vec![1.0, 0.0]])?;
        assert!(deduplicate(&index, &ids(&["a"]), 0.0).is_err());
        assert!(deduplicate(&index, &ids(&["a"]), 1.0).is_err());
        assert!(deduplicate(&index, &ids(&["a", "b"]), 0.5).is_err());
        Ok(())
    }
}
