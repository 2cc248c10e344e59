use rhi_common::{ResourceHandle, ResourceKind};

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Link to the next free slot; `0` ends the list since slot 0 is never free.
    Free { next: u32 },
    Live(ResourceKind),
}

/// Fixed-capacity handle table with an intrusive LIFO free list.
///
/// Handles are stable integers so backends can use them as flat indices into
/// their own tables. Slot 0 is reserved for [`ResourceHandle::NULL`].
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    slots: Vec<Slot>,
    head: u32,
    live: usize,
}

impl SlotAllocator {
    /// `capacity` counts the reserved null slot, so `capacity - 1` handles
    /// can be live at once.
    pub fn new(capacity: usize) -> Self {
        assert!(
            (2..=u32::MAX as usize).contains(&capacity),
            "slot capacity {capacity} out of range"
        );
        let mut slots: Vec<Slot> = (0..capacity)
            .map(|i| Slot::Free {
                next: (i + 1) as u32,
            })
            .collect();
        slots[0] = Slot::Free { next: 0 };
        slots[capacity - 1] = Slot::Free { next: 0 };
        Self {
            slots,
            head: 1,
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn allocate(&mut self, kind: ResourceKind) -> Result<ResourceHandle, QueueError> {
        if self.head == 0 {
            return Err(QueueError::SlotsExhausted {
                capacity: self.capacity(),
            });
        }
        let index = self.head;
        let Slot::Free { next } = self.slots[index as usize] else {
            unreachable!("free list head {index} points at a live slot");
        };
        self.slots[index as usize] = Slot::Live(kind);
        self.head = next;
        self.live += 1;
        Ok(ResourceHandle(index))
    }

    /// Returns the slot to the free list and reports what it held.
    ///
    /// Releasing `NULL`, an out-of-range handle, or a slot that is already
    /// free does nothing and returns `None`.
    pub fn release(&mut self, handle: ResourceHandle) -> Option<ResourceKind> {
        let kind = self.kind_of(handle)?;
        self.slots[handle.index()] = Slot::Free { next: self.head };
        self.head = handle.0;
        self.live -= 1;
        Some(kind)
    }

    pub fn kind_of(&self, handle: ResourceHandle) -> Option<ResourceKind> {
        if handle.is_null() {
            return None;
        }
        match self.slots.get(handle.index()) {
            Some(Slot::Live(kind)) => Some(*kind),
            _ => None,
        }
    }

    pub fn is_live(&self, handle: ResourceHandle) -> bool {
        self.kind_of(handle).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - 1 - self.live
    }

    /// Walks the free list. `None` if it loops or runs into a live slot.
    pub fn free_list_len(&self) -> Option<usize> {
        let mut len = 0;
        let mut cursor = self.head;
        while cursor != 0 {
            if len >= self.capacity() {
                return None;
            }
            match self.slots.get(cursor as usize) {
                Some(Slot::Free { next }) => cursor = *next,
                _ => return None,
            }
            len += 1;
        }
        Some(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn never_hands_out_null() {
        let mut slots = SlotAllocator::new(4);
        let handles: Vec<_> = (0..3)
            .map(|_| slots.allocate(ResourceKind::Buffer).unwrap())
            .collect();
        assert!(handles.iter().all(|h| !h.is_null()));
        assert!(matches!(
            slots.allocate(ResourceKind::Buffer),
            Err(QueueError::SlotsExhausted { capacity: 4 })
        ));
    }

    #[test]
    fn reuse_is_lifo() {
        let mut slots = SlotAllocator::new(16);
        let a = slots.allocate(ResourceKind::Texture).unwrap();
        let b = slots.allocate(ResourceKind::Texture).unwrap();
        slots.release(a);
        slots.release(b);
        assert_eq!(slots.allocate(ResourceKind::Sampler).unwrap(), b);
        assert_eq!(slots.allocate(ResourceKind::Sampler).unwrap(), a);
    }

    #[test]
    fn release_reports_kind_once() {
        let mut slots = SlotAllocator::new(8);
        let h = slots.allocate(ResourceKind::Shader).unwrap();
        assert_eq!(slots.release(h), Some(ResourceKind::Shader));
        assert_eq!(slots.release(h), None);
        assert_eq!(slots.release(ResourceHandle::NULL), None);
        assert_eq!(slots.release(ResourceHandle(999)), None);
        assert_eq!(slots.free_list_len(), Some(7));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Release(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Allocate),
            2 => (0u32..40).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn live_handles_unique_and_free_list_sound(ops in proptest::collection::vec(op(), 1..400)) {
            let capacity = 32;
            let mut slots = SlotAllocator::new(capacity);
            let mut live: HashSet<ResourceHandle> = HashSet::new();

            for op in ops {
                match op {
                    Op::Allocate => match slots.allocate(ResourceKind::Buffer) {
                        Ok(h) => {
                            prop_assert!(!h.is_null());
                            prop_assert!(live.insert(h), "handle {} handed out twice", h);
                        }
                        Err(_) => prop_assert_eq!(live.len(), capacity - 1),
                    },
                    Op::Release(raw) => {
                        let h = ResourceHandle(raw);
                        let was_live = live.remove(&h);
                        prop_assert_eq!(slots.release(h).is_some(), was_live);
                    }
                }
                prop_assert_eq!(slots.live_count(), live.len());
                prop_assert_eq!(slots.free_list_len(), Some(capacity - 1 - live.len()));
            }
        }
    }
}
