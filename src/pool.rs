//! Generation-tagged slot bookkeeping
//!
//! Every queue head and transfer descriptor carries a [`Slot`]. A slot is
//! claimed by the task, and released by whichever side finishes with the
//! descriptor (the task for periodic pipes, the interrupt handler after an
//! async-advance). Releasing a slot bumps its generation, so handles that
//! captured the old generation no longer match.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

pub struct Slot {
    used: AtomicBool,
    removing: AtomicBool,
    generation: AtomicU8,
}

impl Slot {
    pub const fn new() -> Self {
        Slot {
            used: AtomicBool::new(false),
            removing: AtomicBool::new(false),
            generation: AtomicU8::new(0),
        }
    }

    /// Claim the slot, returning its generation.
    ///
    /// Returns `None` if the slot is already in use.
    pub fn try_claim(&self) -> Option<u8> {
        self.used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.removing.store(false, Ordering::Release);
        Some(self.generation.load(Ordering::Acquire))
    }

    /// Return the slot to the pool.
    ///
    /// Releasing a free slot does nothing.
    pub fn release(&self) {
        if self.used.load(Ordering::Acquire) {
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.removing.store(false, Ordering::Release);
            self.used.store(false, Ordering::Release);
        }
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn is_removing(&self) -> bool {
        self.removing.load(Ordering::Acquire)
    }

    /// Mark the slot for removal. Returns `false` if it was already marked,
    /// or if it isn't in use.
    pub fn mark_removing(&self) -> bool {
        self.is_used() && !self.removing.swap(true, Ordering::AcqRel)
    }

    pub fn generation(&self) -> u8 {
        self.generation.load(Ordering::Acquire)
    }

    /// In use, not being removed, and still the same generation
    pub fn is_live(&self, generation: u8) -> bool {
        self.is_used() && !self.is_removing() && self.generation() == generation
    }
}

/// Types that own a slot
pub trait Slotted {
    fn slot(&self) -> &Slot;
}

/// Claim the first free slot, returning its index and generation
pub fn claim<T: Slotted>(items: &[T]) -> Option<(usize, u8)> {
    items
        .iter()
        .enumerate()
        .find_map(|(idx, item)| item.slot().try_claim().map(|generation| (idx, generation)))
}

#[cfg(test)]
mod test {
    use super::{claim, Slot, Slotted};

    fn in_use<T: Slotted>(items: &[T]) -> usize {
        items.iter().filter(|item| item.slot().is_used()).count()
    }

    struct Item(Slot);
    impl Slotted for Item {
        fn slot(&self) -> &Slot {
            &self.0
        }
    }

    #[test]
    fn claim_release() {
        let slot = Slot::new();
        assert_eq!(slot.try_claim(), Some(0));
        assert!(slot.try_claim().is_none());
        assert!(slot.is_live(0));
        slot.release();
        assert!(!slot.is_used());
        assert!(!slot.is_live(0));
        assert_eq!(slot.try_claim(), Some(1));
    }

    #[test]
    fn double_release() {
        let slot = Slot::new();
        slot.try_claim().unwrap();
        slot.release();
        slot.release();
        assert_eq!(slot.generation(), 1);
    }

    #[test]
    fn removing() {
        let slot = Slot::new();
        assert!(!slot.mark_removing());
        let generation = slot.try_claim().unwrap();
        assert!(slot.mark_removing());
        assert!(!slot.mark_removing());
        assert!(slot.is_used());
        assert!(!slot.is_live(generation));
    }

    #[test]
    fn pool() {
        let items = [Item(Slot::new()), Item(Slot::new()), Item(Slot::new())];
        assert_eq!(claim(&items), Some((0, 0)));
        assert_eq!(claim(&items), Some((1, 0)));
        assert_eq!(claim(&items), Some((2, 0)));
        assert_eq!(claim(&items), None);
        assert_eq!(in_use(&items), 3);
        items[1].0.release();
        assert_eq!(in_use(&items), 2);
        assert_eq!(claim(&items), Some((1, 1)));
    }

    #[test]
    fn generation_wraps() {
        let slot = Slot::new();
        for _ in 0..300 {
            slot.try_claim().unwrap();
            slot.release();
        }
        assert_eq!(slot.generation(), (300 % 256) as u8);
    }
}
