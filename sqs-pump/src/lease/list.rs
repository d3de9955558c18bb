use std::collections::HashMap;

/// Stable index of a node in a [`LeaseList`]. Reused after the node is removed.
pub(crate) type Handle = usize;

#[derive(Debug)]
struct Slot<T> {
    id: String,
    value: T,
    prev: Option<Handle>,
    next: Option<Handle>,
}

/// A doubly linked list stored in a vector of slots, with constant-time lookup by message
/// id.
///
/// Removed slots go on a free list and are reused by later pushes, so the backing vector
/// only grows to the largest number of nodes held at once.
#[derive(Debug)]
pub(crate) struct LeaseList<T> {
    slots: Vec<Option<Slot<T>>>,
    free: Vec<Handle>,
    index: HashMap<String, Handle>,
    head: Option<Handle>,
    tail: Option<Handle>,
}

impl<T> Default for LeaseList<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }
}

impl<T> LeaseList<T> {
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Appends a node. A node already holding `id` is replaced.
    pub(crate) fn push_back(&mut self, id: String, value: T) -> Handle {
        if let Some(existing) = self.find(&id) {
            self.remove(existing);
        }

        let slot = Slot {
            id: id.clone(),
            value,
            prev: self.tail,
            next: None,
        };
        let handle = match self.free.pop() {
            Some(handle) => {
                self.slots[handle] = Some(slot);
                handle
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.slot_mut(tail).next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.index.insert(id, handle);
        handle
    }

    pub(crate) fn find(&self, id: &str) -> Option<Handle> {
        self.index.get(id).copied()
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&T> {
        self.slots.get(handle)?.as_ref().map(|slot| &slot.value)
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots.get_mut(handle)?.as_mut().map(|slot| &mut slot.value)
    }

    pub(crate) fn front(&self) -> Option<(Handle, &T)> {
        let head = self.head?;
        self.get(head).map(|value| (head, value))
    }

    pub(crate) fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle)?.take()?;
        self.unlink(slot.prev, slot.next);
        self.index.remove(&slot.id);
        self.free.push(handle);
        Some(slot.value)
    }

    /// Moves a node to the tail. Its handle stays valid.
    pub(crate) fn move_to_back(&mut self, handle: Handle) {
        if self.tail == Some(handle) {
            return;
        }
        let Some(slot) = self.slots.get(handle).and_then(Option::as_ref) else {
            return;
        };
        let (prev, next) = (slot.prev, slot.next);
        self.unlink(prev, next);

        let old_tail = self.tail;
        let slot = self.slot_mut(handle);
        slot.prev = old_tail;
        slot.next = None;
        match old_tail {
            Some(tail) => self.slot_mut(tail).next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
    }

    /// Values from head to tail.
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = self.slots.get(cursor?)?.as_ref()?;
            cursor = slot.next;
            Some(&slot.value)
        })
    }

    /// Joins `prev` and `next` around a node that is being taken out.
    fn unlink(&mut self, prev: Option<Handle>, next: Option<Handle>) {
        match prev {
            Some(prev) => self.slot_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slot_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }

    // Only called with handles reachable from head, tail or a live node's links.
    fn slot_mut(&mut self, handle: Handle) -> &mut Slot<T> {
        match self.slots.get_mut(handle).and_then(Option::as_mut) {
            Some(slot) => slot,
            None => unreachable!("lease list link points at an empty slot"),
        }
    }
}
