use std::collections::HashMap;

/// Client→server message: string keys mapped to string values.
pub type Map = HashMap<String, String>;

/// Pending maps the reorder window will hold. Also bounds how many maps a
/// single forward-channel batch may claim to carry.
pub(crate) const MAP_QUEUE_CAPACITY: usize = 100;

/// Reorder buffer for incoming maps, keyed by the client-assigned offset.
///
/// `next` names the lowest offset not yet delivered to the application.
/// Batches may arrive out of order when forward requests race each other;
/// delivery stalls at the first gap until the missing batch shows up.
pub(crate) struct MapQueue {
    next: usize,
    pending: HashMap<usize, Map>,
    capacity: usize,
}

impl MapQueue {
    pub(crate) fn new(capacity: usize) -> MapQueue {
        MapQueue {
            next: 0,
            pending: HashMap::new(),
            capacity,
        }
    }

    /// Inserts a batch whose first map carries index `offset`.
    ///
    /// Maps the client already delivered (index below `next`) are dropped as
    /// re-uploads. A batch that would push the pending window past capacity
    /// is dropped whole; the acknowledgment flow exposes the resulting gap.
    pub(crate) fn enqueue(&mut self, offset: usize, maps: Vec<Map>) {
        let fresh: Vec<(usize, Map)> = maps
            .into_iter()
            .enumerate()
            .map(|(i, map)| (offset + i, map))
            .filter(|(index, _)| *index >= self.next)
            .collect();

        if fresh.is_empty() || self.pending.len() + fresh.len() > self.capacity {
            return;
        }

        self.pending.extend(fresh);
    }

    /// Removes and returns the map at `next`, advancing the cursor. Returns
    /// `None` when the queue is empty or delivery is stalled at a gap.
    pub(crate) fn dequeue(&mut self) -> Option<Map> {
        let map = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(map)
    }
}
