//! First-fit placement of type windows into a shared slot table.
//!
//! A window is a contiguous run of `back_fill` slots ending at its anchor,
//! plus a sparse set of slots at fixed positive offsets from the anchor.
//! The search only needs to know which slots are taken, so it works over any
//! [`SlotSet`].

pub trait SlotSet {
    fn len(&self) -> usize;
    fn is_occupied(&self, slot: usize) -> bool;
}

/// Dense occupancy bitmap.
#[derive(Debug, Clone)]
pub struct SlotBitmap {
    words: Vec<u64>,
    len: usize,
}

impl SlotBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    #[inline(always)]
    pub fn set(&mut self, slot: usize) {
        debug_assert!(slot < self.len);
        self.words[slot / 64] |= 1 << (slot % 64);
    }

    #[inline(always)]
    pub fn is_set(&self, slot: usize) -> bool {
        slot < self.len && self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// First clear slot at or after `from`.
    pub fn first_clear_from(&self, from: usize) -> Option<usize> {
        let mut index = from / 64;
        let mut word = self.words.get(index)? | ((1u64 << (from % 64)) - 1);
        loop {
            if word != u64::MAX {
                let slot = index * 64 + word.trailing_ones() as usize;
                return (slot < self.len).then_some(slot);
            }
            index += 1;
            word = *self.words.get(index)?;
        }
    }
}

impl SlotSet for SlotBitmap {
    fn len(&self) -> usize {
        self.len
    }

    fn is_occupied(&self, slot: usize) -> bool {
        self.is_set(slot)
    }
}

/// Shape of one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footprint {
    /// contiguous slots, the last one is the anchor
    pub back_fill: usize,
    /// offsets past the anchor, one per dispatch slot
    pub sparse: Vec<usize>,
}

impl Footprint {
    pub fn anchor(&self, start: usize) -> usize {
        start + self.back_fill - 1
    }

    /// Every slot the window occupies when placed at `start`.
    pub fn slots(&self, start: usize) -> impl Iterator<Item = usize> + '_ {
        let anchor = self.anchor(start);
        (start..=anchor).chain(self.sparse.iter().map(move |&offset| anchor + offset))
    }
}

/// First `start >= from` where `len` consecutive slots are free. On a
/// collision the scan resumes right after the colliding slot.
pub fn find_free_run<S: SlotSet + ?Sized>(slots: &S, from: usize, len: usize) -> Option<usize> {
    let mut start = from;
    'search: loop {
        if start + len > slots.len() {
            return None;
        }
        for i in 0..len {
            if slots.is_occupied(start + i) {
                start += i + 1;
                continue 'search;
            }
        }
        return Some(start);
    }
}

/// First-fit placement of `footprint`, scanning from `from`.
///
/// Returns `None` if the table cannot hold it, including the case where a
/// sparse slot would fall past the end of the table.
pub fn find_placement<S: SlotSet + ?Sized>(
    slots: &S,
    from: usize,
    footprint: &Footprint,
) -> Option<usize> {
    debug_assert!(footprint.back_fill > 0);
    let mut start = find_free_run(slots, from, footprint.back_fill)?;
    loop {
        let anchor = footprint.anchor(start);
        let clash = footprint
            .sparse
            .iter()
            .map(|&offset| anchor + offset)
            .find(|&slot| slot >= slots.len() || slots.is_occupied(slot));
        match clash {
            None => return Some(start),
            Some(slot) if slot >= slots.len() => return None,
            Some(_) => start = find_free_run(slots, start + 1, footprint.back_fill)?,
        }
    }
}
