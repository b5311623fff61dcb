/// Pending-work queue whose ordering is decided at pop time.
///
/// Key properties:
/// - Each pop evaluates a caller-supplied score for every pending item; the
///   lowest score wins, so priorities can depend on state that changes while
///   items wait (camera position, item age).
/// - Equal scores are resolved in insertion order.
/// - Draining hands back every pending payload in insertion order.
///
/// Vec-backed: pending backlogs are small (tens of tiles), so a linear scan per
/// pop is cheaper than maintaining a heap under changing priorities.

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkId(pub u64);

#[derive(Debug)]
struct Item<T> {
    id: WorkId,
    payload: T,
}

#[derive(Debug)]
pub struct WorkQueue<T> {
    next_id: u64,
    items: Vec<Item<T>>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            items: Vec::new(),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, payload: T) -> WorkId {
        let id = WorkId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.items.push(Item { id, payload });
        id
    }

    /// Pops the item with the lowest `score`, oldest first among ties.
    ///
    /// NaN scores sort after every finite score.
    pub fn pop_best_by<F>(&mut self, mut score: F) -> Option<(WorkId, T)>
    where
        F: FnMut(&T) -> f64,
    {
        let mut best: Option<(usize, f64)> = None;
        for (idx, item) in self.items.iter().enumerate() {
            let s = score(&item.payload);
            let s = if s.is_nan() { f64::INFINITY } else { s };
            match best {
                // Items are stored in insertion order, so strict `<` keeps the oldest tie.
                Some((_, best_score)) if s >= best_score => {}
                _ => best = Some((idx, s)),
            }
        }

        let (idx, _) = best?;
        // `remove` (not `swap_remove`) keeps the remaining items in insertion order.
        let item = self.items.remove(idx);
        Some((item.id, item.payload))
    }

    /// Removes and returns every pending payload in insertion order.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).map(|item| item.payload).collect()
    }
}
