use pserver::PServerVector;

/// One L-BFGS correction pair with its curvature product `ro = s . y`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Correction {
    pub s: PServerVector,
    pub y: PServerVector,
    pub ro: f32,
}

/// Fixed-capacity ring of L-BFGS corrections, oldest first.
///
/// Eviction hands the evicted entry's server vectors back to the
/// caller for reuse, so a full history shifts without creating or
/// releasing any vector.
pub(crate) struct LbfgsHistory {
    slots: Vec<Correction>,
    start: usize,
    len: usize,
    capacity: usize,
}

impl LbfgsHistory {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be positive");
        Self {
            slots: Vec::with_capacity(capacity),
            start: 0,
            len: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// When full, drops the oldest correction and returns its vector
    /// handles for the caller to fill and push again.
    pub fn evict_for_push(&mut self) -> Option<(PServerVector, PServerVector)> {
        if self.len < self.capacity {
            return None;
        }
        let evicted = self.slots[self.start];
        self.start = (self.start + 1) % self.capacity;
        self.len -= 1;
        Some((evicted.s, evicted.y))
    }

    /// # Panics
    /// If the ring is full; call `evict_for_push` first.
    pub fn push(&mut self, entry: Correction) {
        assert!(self.len < self.capacity, "history ring full");
        let idx = (self.start + self.len) % self.capacity;
        if idx < self.slots.len() {
            self.slots[idx] = entry;
        } else {
            self.slots.push(entry);
        }
        self.len += 1;
    }

    /// The i-th correction, oldest first.
    pub fn get(&self, i: usize) -> Correction {
        assert!(i < self.len, "history index {i} out of range {}", self.len);
        self.slots[(self.start + i) % self.capacity]
    }

    /// Every vector handle currently held, for release at deinit.
    pub fn handles(&self) -> impl Iterator<Item = PServerVector> + '_ {
        self.slots.iter().flat_map(|c| [c.s, c.y])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pserver::{ClientRole, ParameterClient, ParameterServer, ServerOptConfig};

    use super::*;

    #[test]
    fn fills_then_recycles_oldest() {
        let server = Arc::new(ParameterServer::new(
            2,
            1,
            ServerOptConfig { learning_rate: 1.0 },
        ));
        let client = ParameterClient::new(server, ClientRole::Controller);

        let mut h = LbfgsHistory::new(3);
        let mut created = Vec::new();
        for n in 0..3 {
            assert!(h.evict_for_push().is_none());
            let (s, y) = (client.create_vector(), client.create_vector());
            created.push((s, y));
            h.push(Correction { s, y, ro: n as f32 });
        }
        assert_eq!(h.len(), 3);

        // fourth push evicts the first entry and reuses its handles
        let (s, y) = h.evict_for_push().unwrap();
        assert_eq!((s, y), created[0]);
        h.push(Correction { s, y, ro: 9.0 });

        assert_eq!(h.len(), 3);
        assert_eq!(h.get(0).ro, 1.0);
        assert_eq!(h.get(1).ro, 2.0);
        assert_eq!(h.get(2).ro, 9.0);

        // the ring still holds exactly the vectors ever created
        assert_eq!(h.handles().count(), 6);
        for v in h.handles() {
            assert!(created.iter().any(|(s, y)| *s == v || *y == v));
        }
    }
}
