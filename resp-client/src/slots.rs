//! Slot → endpoint table.

use resp_proto::{SLOT_COUNT, SlotRange};

/// Marker for a slot with no known owner.
const UNASSIGNED: u16 = u16::MAX;

/// A fixed table of 16384 entries mapping each hash slot to the endpoint
/// that owns it.
///
/// Endpoints are interned; each table entry is a small index into the
/// endpoint list. Wholesale rebuilds are prepared off to the side and then
/// swapped in, so a reader never sees a half-applied topology.
#[derive(Clone)]
pub struct SlotMap {
    table: Box<[u16]>,
    endpoints: Vec<String>,
    assigned: usize,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    /// An empty map: every slot unassigned.
    pub fn new() -> Self {
        Self {
            table: vec![UNASSIGNED; SLOT_COUNT as usize].into_boxed_slice(),
            endpoints: Vec::new(),
            assigned: 0,
        }
    }

    fn intern(&mut self, endpoint: &str) -> u16 {
        match self.endpoints.iter().position(|e| e == endpoint) {
            Some(idx) => idx as u16,
            None => {
                self.endpoints.push(endpoint.to_string());
                (self.endpoints.len() - 1) as u16
            }
        }
    }

    fn assign(&mut self, slot: u16, idx: u16) {
        let entry = &mut self.table[slot as usize];
        if *entry == UNASSIGNED {
            self.assigned += 1;
        }
        *entry = idx;
    }

    /// Point one slot at `endpoint`. Used for MOVED.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= SLOT_COUNT`.
    pub fn set_slot(&mut self, slot: u16, endpoint: &str) {
        assert!(slot < SLOT_COUNT, "slot {slot} out of range");
        let idx = self.intern(endpoint);
        self.assign(slot, idx);
    }

    /// Point an inclusive range of slots at `endpoint`.
    ///
    /// # Panics
    ///
    /// Panics if `end >= SLOT_COUNT` or `start > end`.
    pub fn set_range(&mut self, start: u16, end: u16, endpoint: &str) {
        assert!(
            start <= end && end < SLOT_COUNT,
            "slot range {start}-{end} out of range"
        );
        let idx = self.intern(endpoint);
        for slot in start..=end {
            self.assign(slot, idx);
        }
    }

    /// Rebuild the whole table from a `CLUSTER SLOTS` reply, routing each
    /// range to its primary. Slots not covered become unassigned.
    pub fn replace_from_ranges(&mut self, ranges: &[SlotRange]) {
        let mut next = SlotMap::new();
        for range in ranges {
            next.set_range(range.start, range.end, &range.primary.endpoint);
        }
        *self = next;
    }

    /// The endpoint owning `slot`, if known.
    pub fn lookup(&self, slot: u16) -> Option<&str> {
        let idx = *self.table.get(slot as usize)?;
        if idx == UNASSIGNED {
            return None;
        }
        self.endpoints.get(idx as usize).map(String::as_str)
    }

    /// Returns true once every slot has an owner.
    pub fn is_initialized(&self) -> bool {
        self.assigned == SLOT_COUNT as usize
    }

    /// Number of slots with an owner.
    pub fn assigned(&self) -> usize {
        self.assigned
    }

    /// Forget every assignment.
    pub fn clear(&mut self) {
        *self = SlotMap::new();
    }

    /// Endpoints that own at least one slot.
    pub fn endpoints(&self) -> Vec<&str> {
        let mut used = vec![false; self.endpoints.len()];
        for &idx in self.table.iter() {
            if idx != UNASSIGNED {
                used[idx as usize] = true;
            }
        }
        self.endpoints
            .iter()
            .zip(used)
            .filter(|(_, used)| *used)
            .map(|(e, _)| e.as_str())
            .collect()
    }
}

impl std::fmt::Debug for SlotMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotMap")
            .field("assigned", &self.assigned)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}
