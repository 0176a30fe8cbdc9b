//! Reference-counted node storage
//!
//! Tree nodes live in an [`Arena`] and refer to each other through
//! [`Handle`]s. A handle counts as an owning (strong) reference only when the
//! holder has retained it; every other copy is a weak reference that is
//! checked against the slot generation on access, so a handle to a freed
//! node never resolves to the node that reuses its slot.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Generational index into an [`Arena`]
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> u32 {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    refs: u32,
    value: Option<T>,
}

/// Slot storage with per-slot strong reference counts
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store `value` and return a handle holding its only strong reference
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.refs = 1;
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            refs: 1,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    fn slot_mut(&mut self, handle: Handle<T>) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slot(handle).and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slot_mut(handle).and_then(|slot| slot.value.as_mut())
    }

    /// Whether `handle` still refers to a live value
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_some()
    }

    /// Number of strong references held on `handle`, zero once freed
    pub fn refs(&self, handle: Handle<T>) -> u32 {
        self.slot(handle).map_or(0, |slot| slot.refs)
    }

    /// Take one more strong reference; fails on a freed handle
    pub fn retain(&mut self, handle: Handle<T>) -> bool {
        match self.slot_mut(handle) {
            Some(slot) => {
                slot.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one strong reference, returning the value when it was the last
    pub fn release(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slot_mut(handle)?;
        slot.refs -= 1;
        if slot.refs > 0 {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        let value = slot.value.take();
        self.free.push(handle.index);
        self.live -= 1;
        value
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over live values
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_frees_on_last_reference() {
        let mut arena = Arena::new();
        let handle = arena.insert("a");
        assert!(arena.retain(handle));
        assert_eq!(arena.refs(handle), 2);

        assert_eq!(arena.release(handle), None);
        assert_eq!(arena.release(handle), Some("a"));
        assert!(!arena.contains(handle));
        assert!(arena.is_empty());
    }

    #[test]
    fn test_stale_handle_does_not_resolve_to_reused_slot() {
        let mut arena = Arena::new();
        let old = arena.insert(1);
        arena.release(old);
        let new = arena.insert(2);

        assert_eq!(old.index(), new.index(), "The slot is reused");
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.get(new), Some(&2));
        assert!(!arena.retain(old), "Retaining a freed handle must fail");
        assert_eq!(arena.release(old), None);
        assert_eq!(arena.refs(new), 1);
    }

    #[test]
    fn test_iter_skips_freed() {
        let mut arena = Arena::new();
        let a = arena.insert('a');
        let _b = arena.insert('b');
        arena.release(a);
        let values: Vec<char> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec!['b']);
        assert_eq!(arena.len(), 1);
    }
}
