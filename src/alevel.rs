//! A-layer — the learned router that narrows a key to a candidate range
//! of B-layer slots before the B-layer's own binary search takes over,
//! grounded in `original_source/src/alevel.h`/`alevel.cc` and resolved
//! per SPEC_FULL.md §4.5.
//!
//! Three historical variants are kept behind one `Router` enum rather than
//! picking a single one, mirroring the original repo's own revision
//! history (CDF shipped first; PGM and RMI were added as drop-in
//! replacements without changing the B-layer's contract).

/// How finely the A-layer partitions the key space. Chosen at
/// `StoreConfig` build time; rebuilt from scratch whenever the B-layer
/// it routes into is replaced (migration or expansion completion).
#[derive(Clone, Debug)]
pub enum Router {
    /// Equal-width cumulative distribution table: `table[i]` holds the
    /// index of the first B-layer entry whose routing key falls in the
    /// `i`-th of `buckets` equal-width key-space buckets spanning
    /// `[min, min + span]`. `min`/`span` are retained alongside `table`
    /// so `locate` can reproduce `build_cdf`'s bucket arithmetic exactly,
    /// the way the original's `CDFIndex_` re-derives a bucket against its
    /// stored `min_key_`.
    Cdf {
        buckets: usize,
        min: u64,
        span: u64,
        table: Vec<u32>,
    },
    /// Greedy piecewise-linear segmentation with error bound `epsilon`:
    /// each segment is `(slope, intercept, first_key, first_index)` and
    /// guarantees the true index is within `epsilon` of the prediction.
    Pgm {
        epsilon: u32,
        segments: Vec<PgmSegment>,
    },
    /// Two-stage linear model: one root model picks a leaf model, the
    /// leaf model predicts an index, corrected by local exponential
    /// search (unchanged from the RMI literature's own recovery step).
    Rmi {
        root: LinearModel,
        leaves: Vec<LinearModel>,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct PgmSegment {
    pub first_key: u64,
    pub first_index: u32,
    pub slope: f64,
    pub intercept: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct LinearModel {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearModel {
    fn predict(&self, key: u64) -> f64 {
        self.slope * (key as f64) + self.intercept
    }
}

/// Default CDF bucket count when a `StoreConfig` doesn't override it
/// (mirrors the original's `DEFAULT_COMBO_TREE_SPAN`).
pub const DEFAULT_CDF_BUCKETS: usize = 256;

/// Default PGM error bound, used when a `StoreConfig` selects
/// `RouterVariant::Pgm` without overriding it.
pub const DEFAULT_PGM_EPSILON: u32 = 32;

/// Default RMI leaf-model count, used when a `StoreConfig` selects
/// `RouterVariant::Rmi` without overriding it.
pub const DEFAULT_RMI_LEAVES: usize = 64;

/// Build-time choice of A-layer model (SPEC_FULL.md §4.5), selected via
/// `StoreConfig` rather than hard-coded to a single variant — mirroring
/// the original repo's own revision history, where CDF shipped first and
/// PGM/RMI were added later as drop-in replacements behind the same
/// B-layer contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RouterVariant {
    #[default]
    Cdf,
    Pgm,
    Rmi,
}

impl Router {
    /// Build the variant selected by `StoreConfig`, with that config's
    /// tunables (`cdf_buckets` and friends).
    pub fn build(
        variant: RouterVariant,
        sorted_keys: &[u64],
        cdf_buckets: usize,
        pgm_epsilon: u32,
        rmi_leaves: usize,
    ) -> Self {
        match variant {
            RouterVariant::Cdf => Self::build_cdf(sorted_keys, cdf_buckets),
            RouterVariant::Pgm => Self::build_pgm(sorted_keys, pgm_epsilon),
            RouterVariant::Rmi => Self::build_rmi(sorted_keys, rmi_leaves),
        }
    }

    pub fn build_cdf(sorted_keys: &[u64], buckets: usize) -> Self {
        let buckets = buckets.max(1);
        if sorted_keys.is_empty() {
            return Router::Cdf {
                buckets,
                min: 0,
                span: 1,
                table: vec![0; buckets + 1],
            };
        }
        let min = sorted_keys[0];
        let max = *sorted_keys.last().unwrap();
        let span = (max - min).max(1);
        let mut table = vec![0u32; buckets + 1];
        let mut idx = 0usize;
        for b in 0..=buckets {
            let boundary = min + (span as u128 * b as u128 / buckets as u128) as u64;
            while idx < sorted_keys.len() && sorted_keys[idx] < boundary {
                idx += 1;
            }
            table[b] = idx as u32;
        }
        Router::Cdf {
            buckets,
            min,
            span,
            table,
        }
    }

    pub fn build_pgm(sorted_keys: &[u64], epsilon: u32) -> Self {
        let mut segments = Vec::new();
        let mut i = 0usize;
        while i < sorted_keys.len() {
            let start = i;
            let first_key = sorted_keys[i];
            // Greedily extend the segment while every point stays within
            // `epsilon` of the line through the first two points.
            let mut j = i + 1;
            let mut slope = 0.0;
            while j < sorted_keys.len() {
                let dx = (sorted_keys[j] - first_key) as f64;
                let dy = (j - start) as f64;
                let candidate_slope = if dx > 0.0 { dy / dx } else { 0.0 };
                let within = sorted_keys[start..=j].iter().enumerate().all(|(k, &key)| {
                    let pred = candidate_slope * (key - first_key) as f64;
                    (pred - k as f64).abs() <= epsilon as f64
                });
                if !within {
                    break;
                }
                slope = candidate_slope;
                j += 1;
            }
            let first_index = start as u32;
            segments.push(PgmSegment {
                first_key,
                first_index,
                slope,
                // predicted index = slope*(key - first_key) + first_index
                intercept: first_index as f64 - (first_key as f64) * slope,
            });
            i = j.max(start + 1);
        }
        Router::Pgm { epsilon, segments }
    }

    pub fn build_rmi(sorted_keys: &[u64], leaf_count: usize) -> Self {
        let leaf_count = leaf_count.max(1);
        if sorted_keys.is_empty() {
            return Router::Rmi {
                root: LinearModel {
                    slope: 0.0,
                    intercept: 0.0,
                },
                leaves: vec![
                    LinearModel {
                        slope: 0.0,
                        intercept: 0.0
                    };
                    leaf_count
                ],
            };
        }
        let n = sorted_keys.len();
        let min = sorted_keys[0] as f64;
        let max = *sorted_keys.last().unwrap() as f64;
        let span = (max - min).max(1.0);
        let root = LinearModel {
            slope: leaf_count as f64 / span,
            intercept: -min * leaf_count as f64 / span,
        };
        let mut leaves = vec![
            LinearModel {
                slope: 0.0,
                intercept: 0.0
            };
            leaf_count
        ];
        for l in 0..leaf_count {
            let lo = l * n / leaf_count;
            let hi = ((l + 1) * n / leaf_count).max(lo + 1).min(n);
            let slice = &sorted_keys[lo..hi];
            if slice.len() < 2 {
                leaves[l] = LinearModel {
                    slope: 0.0,
                    intercept: lo as f64,
                };
                continue;
            }
            let kmin = slice[0] as f64;
            let kmax = *slice.last().unwrap() as f64;
            let kspan = (kmax - kmin).max(1.0);
            leaves[l] = LinearModel {
                slope: slice.len() as f64 / kspan,
                intercept: lo as f64 - kmin * slice.len() as f64 / kspan,
            };
        }
        Router::Rmi { root, leaves }
    }

    /// Returns a `[begin, end)` candidate range of B-layer indices the
    /// caller should binary-search within. Deliberately wide enough to
    /// tolerate model error — the B-layer's own comparisons are the
    /// source of truth.
    pub fn locate(&self, key: u64, num_entries: usize) -> (usize, usize) {
        if num_entries == 0 {
            return (0, 0);
        }
        match self {
            Router::Cdf {
                buckets,
                min,
                span,
                table,
            } => {
                // Reconstruct the bucket index the same way `build_cdf`
                // placed keys into it, against the stored `min`/`span`.
                let b = Self::cdf_bucket_for(*min, *span, *buckets, key);
                let begin = table.get(b).copied().unwrap_or(0) as usize;
                let end = table.get(b + 1).copied().unwrap_or(num_entries as u32) as usize;
                Self::repair_range(begin, end, num_entries)
            }
            Router::Pgm { epsilon, segments } => {
                let seg = Self::pgm_segment_for(segments, key);
                let pred = seg
                    .map(|s| s.slope * (key as f64) + s.intercept)
                    .unwrap_or(0.0);
                let pred = pred.max(0.0) as usize;
                let lo = pred.saturating_sub(*epsilon as usize);
                let hi = (pred + *epsilon as usize + 1).min(num_entries);
                Self::repair_range(lo, hi, num_entries)
            }
            Router::Rmi { root, leaves } => {
                let leaf_idx = (root.predict(key) as isize)
                    .clamp(0, leaves.len() as isize - 1) as usize;
                let pred = leaves[leaf_idx].predict(key).max(0.0) as usize;
                let margin = (num_entries / leaves.len().max(1)).max(8);
                let lo = pred.saturating_sub(margin);
                let hi = (pred + margin).min(num_entries);
                Self::repair_range(lo, hi, num_entries)
            }
        }
    }

    /// Invert `build_cdf`'s `boundary = min + span*b/buckets` to recover
    /// which bucket `key` falls into, the same arithmetic the original's
    /// `CDFIndex_` runs against its stored `min_key_`.
    fn cdf_bucket_for(min: u64, span: u64, buckets: usize, key: u64) -> usize {
        if key <= min {
            return 0;
        }
        let delta = (key - min) as u128;
        let b = (delta * buckets as u128) / (span.max(1) as u128);
        (b as usize).min(buckets.saturating_sub(1))
    }

    fn pgm_segment_for(segments: &[PgmSegment], key: u64) -> Option<&PgmSegment> {
        match segments.binary_search_by_key(&key, |s| s.first_key) {
            Ok(i) => Some(&segments[i]),
            Err(0) => segments.first(),
            Err(i) => Some(&segments[i - 1]),
        }
    }

    /// Widen or clamp a degenerate/out-of-range prediction to a valid
    /// `[begin, end)` within `[0, num_entries)` — mirrors the original's
    /// `GetBLevelRange_` boundary repair.
    fn repair_range(begin: usize, end: usize, num_entries: usize) -> (usize, usize) {
        let begin = begin.min(num_entries);
        let mut end = end.min(num_entries);
        if end <= begin {
            end = (begin + 1).min(num_entries);
        }
        (begin, end)
    }
}
