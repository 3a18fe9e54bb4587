/*!
 * Generational Slot Table
 * Stable handles whose slots can be recycled without aliasing old keys
 */

use serde::{Deserialize, Serialize};

/// Key into a [`SlotTable`]: slot index plus the generation it was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a single u64 (generation in the high half)
    #[inline]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of values addressed by generational keys
///
/// A removed slot bumps its generation, so stale keys miss instead of
/// resolving to whatever reused the slot. `clear` is constant time for
/// `Copy` payloads: it raises the generation floor above every generation
/// ever issued and drops the slots wholesale.
#[derive(Debug, Clone)]
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    vacant: Vec<u32>,
    len: usize,
    generation_floor: u32,
    max_generation: u32,
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            vacant: Vec::new(),
            len: 0,
            generation_floor: 0,
            max_generation: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> SlotKey {
        self.len += 1;
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return SlotKey {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: self.generation_floor,
            value: Some(value),
        });
        SlotKey {
            index,
            generation: self.generation_floor,
        }
    }

    #[inline]
    pub fn get(&self, key: SlotKey) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    #[inline]
    pub fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.max_generation = self.max_generation.max(slot.generation);
        self.vacant.push(key.index);
        self.len -= 1;
        Some(value)
    }

    /// Drop every value and invalidate every key issued so far
    pub fn clear(&mut self) {
        self.generation_floor = self.max_generation.wrapping_add(1);
        self.max_generation = self.generation_floor;
        self.slots.clear();
        self.vacant.clear();
        self.len = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotKey {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
