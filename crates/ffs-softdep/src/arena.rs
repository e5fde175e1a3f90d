#![forbid(unsafe_code)]
//! Generation-checked slot storage, one arena per dependency kind.
//!
//! An [`Idx`] stays valid until its slot is released; after that every use
//! of the stale index is reported instead of silently aliasing whatever
//! reuses the slot.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Typed index into an [`Arena<T>`].
pub struct Idx<T> {
    slot: u32,
    generation: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Idx<T> {
    #[must_use]
    pub fn slot(self) -> u32 {
        self.slot
    }
}

impl<T> Clone for Idx<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Idx<T> {}

impl<T> PartialEq for Idx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Idx<T> {}

impl<T> Hash for Idx<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Idx<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with a free list.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> Idx<T> {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.value = Some(value);
            return Idx {
                slot,
                generation: entry.generation,
                _kind: PhantomData,
            };
        }
        let slot = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Idx {
            slot,
            generation: 0,
            _kind: PhantomData,
        }
    }

    #[must_use]
    pub fn get(&self, idx: Idx<T>) -> Option<&T> {
        self.slots
            .get(idx.slot as usize)
            .filter(|s| s.generation == idx.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, idx: Idx<T>) -> Option<&mut T> {
        self.slots
            .get_mut(idx.slot as usize)
            .filter(|s| s.generation == idx.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Release the slot; the index and every copy of it become stale.
    pub fn remove(&mut self, idx: Idx<T>) -> Option<T> {
        let slot = self.slots.get_mut(idx.slot as usize)?;
        if slot.generation != idx.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx.slot);
        self.live -= 1;
        Some(value)
    }

    #[must_use]
    pub fn contains(&self, idx: Idx<T>) -> bool {
        self.get(idx).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Idx<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    Idx {
                        slot: u32::try_from(i).unwrap_or(u32::MAX),
                        generation: s.generation,
                        _kind: PhantomData,
                    },
                    v,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_index_goes_stale() {
        let mut arena = Arena::default();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));
        let b = arena.insert("b");
        assert_eq!(a.slot(), b.slot(), "slot is reused");
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b), Some(&"b"));
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn iter_skips_free_slots() {
        let mut arena = Arena::default();
        let ids: Vec<_> = (0..5).map(|i| arena.insert(i)).collect();
        arena.remove(ids[1]);
        arena.remove(ids[3]);
        let seen: Vec<i32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(seen, vec![0, 2, 4]);
        assert!(!arena.is_empty());
    }
}
