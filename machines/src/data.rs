use ndarray::{Array2, Axis};
use parking_lot::Mutex;
use rand::seq::SliceRandom;

/// One mini-batch of training data, consumed by a single
/// forward/backward round.
#[derive(Clone, Debug, Default)]
pub struct DataBatch {
    pub inputs: Array2<f32>,
    pub targets: Array2<f32>,
}

impl DataBatch {
    pub fn new(inputs: Array2<f32>, targets: Array2<f32>) -> Self {
        assert_eq!(
            inputs.nrows(),
            targets.nrows(),
            "inputs and targets disagree on batch size"
        );
        Self { inputs, targets }
    }

    /// Number of instances in the batch.
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of mini-batches, shared by every worker thread of a pass.
///
/// `next_batch` hands out disjoint slices of the epoch until it returns
/// 0; `reset` starts the next epoch, reshuffling unless skip-shuffle
/// was set.
pub trait DataProvider: Send + Sync {
    /// Fills `batch` with up to `size` instances and returns how many
    /// were produced, 0 at the end of the epoch.
    fn next_batch(&self, size: usize, batch: &mut DataBatch) -> usize;

    fn reset(&self);

    /// The next `reset` keeps the current instance order. One-shot.
    fn set_skip_shuffle(&self);
}

struct Cursor {
    order: Vec<usize>,
    pos: usize,
    skip_shuffle: bool,
}

/// A [`DataProvider`] over an in-memory dataset.
pub struct InMemoryDataProvider {
    inputs: Array2<f32>,
    targets: Array2<f32>,
    cursor: Mutex<Cursor>,
}

impl InMemoryDataProvider {
    pub fn new(inputs: Array2<f32>, targets: Array2<f32>) -> Self {
        assert_eq!(
            inputs.nrows(),
            targets.nrows(),
            "inputs and targets disagree on instance count"
        );
        let order = (0..inputs.nrows()).collect();
        Self {
            inputs,
            targets,
            cursor: Mutex::new(Cursor {
                order,
                pos: 0,
                skip_shuffle: true, // first epoch runs in natural order
            }),
        }
    }

    pub fn num_instances(&self) -> usize {
        self.inputs.nrows()
    }
}

impl DataProvider for InMemoryDataProvider {
    fn next_batch(&self, size: usize, batch: &mut DataBatch) -> usize {
        let rows: Vec<usize> = {
            let mut cur = self.cursor.lock();
            let end = (cur.pos + size).min(cur.order.len());
            let rows = cur.order[cur.pos..end].to_vec();
            cur.pos = end;
            rows
        };
        if rows.is_empty() {
            return 0;
        }
        batch.inputs = self.inputs.select(Axis(0), &rows);
        batch.targets = self.targets.select(Axis(0), &rows);
        rows.len()
    }

    fn reset(&self) {
        let mut cur = self.cursor.lock();
        cur.pos = 0;
        if cur.skip_shuffle {
            cur.skip_shuffle = false;
        } else {
            cur.order.shuffle(&mut rand::rng());
        }
    }

    fn set_skip_shuffle(&self) {
        self.cursor.lock().skip_shuffle = true;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn provider() -> InMemoryDataProvider {
        let inputs = array![[0.0], [1.0], [2.0], [3.0], [4.0]];
        let targets = inputs.clone();
        InMemoryDataProvider::new(inputs, targets)
    }

    #[test]
    fn drains_whole_epoch_in_batches() {
        let p = provider();
        let mut batch = DataBatch::default();
        let mut total = 0;
        while p.next_batch(2, &mut batch) > 0 {
            assert_eq!(batch.inputs.nrows(), batch.targets.nrows());
            total += batch.len();
        }
        assert_eq!(total, 5);
        assert_eq!(p.next_batch(2, &mut batch), 0);
    }

    #[test]
    fn skip_shuffle_preserves_order() {
        let p = provider();
        p.set_skip_shuffle();
        p.reset();

        let mut batch = DataBatch::default();
        let mut seen = Vec::new();
        while p.next_batch(2, &mut batch) > 0 {
            seen.extend(batch.inputs.column(0).iter().copied());
        }
        assert_eq!(seen, [0.0, 1.0, 2.0, 3.0, 4.0]);
    }
}
