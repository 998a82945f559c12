use std::collections::BTreeSet;

/// Hands out the smallest free packet identifier in `1..=65535`.
#[derive(Debug)]
pub struct PacketIds {
    in_use: BTreeSet<u16>,
    // every id below `floor` is in use
    floor: u32,
}

impl Default for PacketIds {
    fn default() -> Self {
        Self {
            in_use: BTreeSet::new(),
            floor: 1,
        }
    }
}

impl PacketIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` once all 65535 identifiers are taken.
    pub fn allocate(&mut self) -> Option<u16> {
        let mut candidate = self.floor;
        let start = u16::try_from(candidate).ok()?;
        for &id in self.in_use.range(start..) {
            if u32::from(id) != candidate {
                break;
            }
            candidate += 1;
        }
        let id = u16::try_from(candidate).ok()?;
        self.in_use.insert(id);
        self.floor = candidate + 1;
        Some(id)
    }

    pub fn release(&mut self, id: u16) -> bool {
        let removed = self.in_use.remove(&id);
        if removed {
            self.floor = self.floor.min(u32::from(id));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }
}
