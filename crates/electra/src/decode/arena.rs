use bitflags::bitflags;

use crate::unit::DecodableUnit;

bitflags! {
    /// Logical owners of an arena slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Holders: u8 {
        /// Waiting for submission or for its decoded output
        const INPUT = 0b01;
        /// Retained for decoder-loss replay
        const HISTORY = 0b10;
    }
}

/// Generation-checked handle into a [`UnitArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitKey {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    unit: Option<DecodableUnit>,
    holders: Holders,
}

/// Owns every unit the decode engine currently references.
///
/// A unit stays alive while at least one holder (in-flight input or replay
/// history) references it; the slot is recycled when the last holder lets go.
#[derive(Debug, Default)]
pub struct UnitArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl UnitArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `unit`, held as input.
    pub fn insert(&mut self, unit: DecodableUnit) -> UnitKey {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.unit = Some(unit);
            slot.holders = Holders::INPUT;
            return UnitKey {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            unit: Some(unit),
            holders: Holders::INPUT,
        });
        UnitKey {
            index,
            generation: 0,
        }
    }

    fn slot(&self, key: UnitKey) -> Option<&Slot> {
        self.slots
            .get(key.index as usize)
            .filter(|s| s.generation == key.generation && s.unit.is_some())
    }

    fn slot_mut(&mut self, key: UnitKey) -> Option<&mut Slot> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|s| s.generation == key.generation && s.unit.is_some())
    }

    pub fn get(&self, key: UnitKey) -> Option<&DecodableUnit> {
        self.slot(key).and_then(|s| s.unit.as_ref())
    }

    #[cfg(test)]
    fn holders(&self, key: UnitKey) -> Holders {
        self.slot(key).map_or(Holders::empty(), |s| s.holders)
    }

    pub fn retain(&mut self, key: UnitKey, holder: Holders) {
        if let Some(slot) = self.slot_mut(key) {
            slot.holders |= holder;
        }
    }

    /// Drops `holder`'s claim; frees the slot once nothing holds it.
    pub fn release(&mut self, key: UnitKey, holder: Holders) {
        let Some(slot) = self.slot_mut(key) else {
            return;
        };
        slot.holders.remove(holder);
        if slot.holders.is_empty() {
            slot.unit = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(key.index);
            self.live -= 1;
        }
    }

    /// Number of units currently alive.
    pub fn len(&self) -> usize {
        self.live
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.live == 0
    }
}
