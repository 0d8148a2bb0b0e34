use rand::Rng;

/// Weighted sampling without replacement.
///
/// Instance weights live in the leaves of a complete binary tree whose
/// inner nodes hold partial sums, so drawing an instance and removing
/// its mass are both `O(log n)`. The returned sample weights are
/// adjusted upward to compensate for the instances a with-replacement
/// sampler would have drawn repeatedly.
pub struct ImportanceSamplerWithoutReplacement<R: Rng> {
    rng: R,
    /// Binary tree of partial weight sums; leaves start at
    /// `(1 << (tree_level - 1)) - 1`.
    tree: Vec<f64>,
    num_instances: usize,
    tree_level: usize,
    /// Restore sampled instances' weights after `sampling` instead of
    /// leaving them zeroed.
    keep_weights_after_sampling: bool,
}

impl<R: Rng> ImportanceSamplerWithoutReplacement<R> {
    pub fn new(rng: R, keep_weights_after_sampling: bool) -> Self {
        Self {
            rng,
            tree: Vec::new(),
            num_instances: 0,
            tree_level: 0,
            keep_weights_after_sampling,
        }
    }

    fn leaf_offset(&self) -> usize {
        (1usize << (self.tree_level - 1)) - 1
    }

    /// Initializes the sampler over `num_instances` weighted instances
    /// (weight 1 each when `init_weights` is `None`) and returns the
    /// total weight.
    ///
    /// # Panics
    /// If `num_instances` is zero.
    pub fn init(&mut self, num_instances: usize, init_weights: Option<&[f64]>) -> f64 {
        assert!(num_instances > 0, "cannot sample from zero instances");
        if let Some(w) = init_weights {
            assert_eq!(w.len(), num_instances, "weight count mismatch");
        }

        self.num_instances = num_instances;
        self.tree_level = 1;
        while (1usize << (self.tree_level - 1)) < num_instances {
            self.tree_level += 1;
        }
        self.tree = vec![0.0; (1usize << self.tree_level) - 1];

        let off = self.leaf_offset();
        match init_weights {
            Some(w) => self.tree[off..off + num_instances].copy_from_slice(w),
            None => self.tree[off..off + num_instances].fill(1.0),
        }
        for i in (0..off).rev() {
            self.tree[i] = self.tree[2 * i + 1] + self.tree[2 * i + 2];
        }
        self.tree[0]
    }

    /// Descends from the root to the leaf whose cumulative weight range
    /// contains `rn`.
    fn binary_search(&self, rn: f64) -> usize {
        let mut j = 0;
        let mut val = rn;
        for _ in 0..self.tree_level - 1 {
            let left = 2 * j + 1;
            let right = left + 1;
            assert!(self.tree[j] != 0.0, "no weight mass left under node {j}");
            if self.tree[left] != 0.0 && val <= self.tree[left] {
                j = left;
            } else {
                val -= self.tree[left];
                j = right;
            }
        }
        j
    }

    fn update_one_leaf(&mut self, mut j: usize, w: f64) {
        self.tree[j] = w;
        while j > 0 {
            j = (j - 1) / 2;
            self.tree[j] = self.tree[2 * j + 1] + self.tree[2 * j + 2];
        }
    }

    /// Draws up to `num_samples` distinct instances.
    ///
    /// Indices and their adjusted weights are appended to the output
    /// vectors; returns `(num_sampled, weight_sum)`. When `num_samples`
    /// covers every instance, all instances come back with their
    /// original weights.
    pub fn sampling(
        &mut self,
        num_samples: usize,
        indices: &mut Vec<usize>,
        weights: &mut Vec<f64>,
    ) -> (usize, f64) {
        indices.clear();
        weights.clear();

        let off = self.leaf_offset();
        if num_samples >= self.num_instances {
            indices.extend(0..self.num_instances);
            weights.extend_from_slice(&self.tree[off..off + self.num_instances]);
            return (self.num_instances, self.tree[0]);
        }

        // seq_w[i] is the expected number of redraws a with-replacement
        // sampler spends on the first i+1 picks
        let mut seq_w = vec![0.0; num_samples];
        let mut orig_w = vec![0.0; num_samples];
        let mut remaining = self.tree[0];

        for i in 0..num_samples {
            if i != 0 {
                seq_w[i - 1] = 1.0 / remaining;
            }
            let rn = self.rng.random::<f64>() * remaining;
            let j = self.binary_search(rn);
            assert!(self.tree[j] != 0.0, "sampled a zero-weight leaf {j}");
            indices.push(j - off);
            orig_w[i] = self.tree[j];
            self.update_one_leaf(j, 0.0);
            remaining = self.tree[0];
        }
        assert!(remaining != 0.0, "weight mass exhausted during sampling");
        seq_w[num_samples - 1] = 1.0 / remaining;

        let mut acc_seq_w = 0.0;
        let mut sum_w = 0.0;
        weights.resize(num_samples, 0.0);
        for i in (0..num_samples).rev() {
            acc_seq_w += seq_w[i];
            weights[i] = 1.0 + acc_seq_w * orig_w[i];
            sum_w += weights[i];
        }

        if self.keep_weights_after_sampling {
            let pairs: Vec<(usize, f64)> =
                indices.iter().copied().zip(orig_w.iter().copied()).collect();
            for (idx, w) in pairs {
                self.update_one_leaf(idx + off, w);
            }
        }

        (num_samples, sum_w)
    }

    /// Overwrites the weights of the given instances and returns the new
    /// total weight.
    pub fn update_weights(&mut self, indices: &[usize], weights: &[f64]) -> f64 {
        assert_eq!(indices.len(), weights.len(), "index and weight count mismatch");
        let off = self.leaf_offset();
        for (idx, w) in indices.iter().zip(weights) {
            self.update_one_leaf(idx + off, *w);
        }
        self.tree[0]
    }

    pub fn num_instances(&self) -> usize {
        self.num_instances
    }

    /// Copies the current instance weights into `out` and returns their
    /// sum.
    pub fn weights(&self, out: &mut Vec<f64>) -> f64 {
        let off = self.leaf_offset();
        out.clear();
        out.extend_from_slice(&self.tree[off..off + self.num_instances]);
        self.tree[0]
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn sampler(keep: bool) -> ImportanceSamplerWithoutReplacement<StdRng> {
        ImportanceSamplerWithoutReplacement::new(StdRng::seed_from_u64(7), keep)
    }

    #[test]
    fn init_returns_total_weight() {
        let mut s = sampler(false);
        assert_eq!(s.init(5, None), 5.0);
        assert_eq!(s.init(3, Some(&[1.0, 2.0, 4.0])), 7.0);

        let mut w = Vec::new();
        assert_eq!(s.weights(&mut w), 7.0);
        assert_eq!(w, [1.0, 2.0, 4.0]);
    }

    #[test]
    fn oversampling_returns_every_instance() {
        let mut s = sampler(false);
        s.init(4, Some(&[1.0, 2.0, 3.0, 4.0]));

        let (mut idx, mut w) = (Vec::new(), Vec::new());
        let (n, total) = s.sampling(10, &mut idx, &mut w);
        assert_eq!(n, 4);
        assert_eq!(idx, [0, 1, 2, 3]);
        assert_eq!(w, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(total, 10.0);
    }

    #[test]
    fn samples_are_distinct_and_weighted_up() {
        let mut s = sampler(false);
        s.init(64, None);

        let (mut idx, mut w) = (Vec::new(), Vec::new());
        let (n, total) = s.sampling(16, &mut idx, &mut w);
        assert_eq!(n, 16);

        let mut seen = idx.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 16, "sampling repeated an instance");

        // adjusted weights over-represent each pick
        assert!(w.iter().all(|x| *x > 1.0));
        assert!((total - w.iter().sum::<f64>()).abs() < 1e-12);

        // sampled leaves were zeroed
        let mut remaining = Vec::new();
        assert_eq!(s.weights(&mut remaining), 48.0);
        for i in &idx {
            assert_eq!(remaining[*i], 0.0);
        }
    }

    #[test]
    fn keep_weights_restores_leaves() {
        let mut s = sampler(true);
        s.init(8, None);

        let (mut idx, mut w) = (Vec::new(), Vec::new());
        s.sampling(3, &mut idx, &mut w);

        let mut after = Vec::new();
        assert_eq!(s.weights(&mut after), 8.0);
        assert!(after.iter().all(|x| *x == 1.0));
    }

    #[test]
    fn update_weights_reshapes_the_distribution() {
        let mut s = sampler(false);
        s.init(4, None);
        assert_eq!(s.update_weights(&[0, 1, 3], &[0.0, 0.0, 0.0]), 1.0);
        assert_eq!(s.update_weights(&[2], &[5.0]), 5.0);

        let mut w = Vec::new();
        assert_eq!(s.weights(&mut w), 5.0);
        assert_eq!(w, [0.0, 0.0, 5.0, 0.0]);
    }
}
