//! Dense storage for a worker's live connections.
//!
//! Slots are packed: removing one moves the last entry into the hole, so
//! iteration never visits empty slots. Slot order carries no meaning.

/// Outcome of [`SlotTable::remove`].
#[derive(Debug)]
pub struct Removed<T> {
    pub value: T,
    /// The index the last entry occupied before it was moved into the hole,
    /// if a move happened.
    pub moved_from: Option<usize>,
}

#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<T>,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> SlotTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Appends `value` and returns its index.
    pub fn push(&mut self, value: T) -> usize {
        self.slots.push(value);
        self.slots.len() - 1
    }

    /// Removes the entry at `index`, filling the hole with the last entry.
    pub fn remove(&mut self, index: usize) -> Option<Removed<T>> {
        if index >= self.slots.len() {
            return None;
        }
        let last = self.slots.len() - 1;
        let value = self.slots.swap_remove(index);
        Some(Removed {
            value,
            moved_from: (index != last).then_some(last),
        })
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }

    /// Removes every entry, yielding them in slot order.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.slots.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_returns_dense_indices() {
        let mut table = SlotTable::default();
        assert_eq!(table.push('a'), 0);
        assert_eq!(table.push('b'), 1);
        assert_eq!(table.len(), 2);
    }

    /// Removal from the middle moves the last entry into the hole
    #[test]
    fn test_remove_compacts() {
        let mut table = SlotTable::with_capacity(4);
        for c in ['a', 'b', 'c', 'd'] {
            table.push(c);
        }

        let removed = table.remove(1).unwrap();
        assert_eq!(removed.value, 'b');
        assert_eq!(removed.moved_from, Some(3));
        assert_eq!(table.get_mut(1), Some(&mut 'd'));
        assert_eq!(table.len(), 3);

        let removed = table.remove(2).unwrap();
        assert_eq!(removed.value, 'c');
        assert_eq!(removed.moved_from, None);

        assert!(table.remove(5).is_none());
        assert_eq!(table.iter().copied().collect::<Vec<_>>(), vec!['a', 'd']);
    }

    #[test]
    fn test_drain_empties() {
        let mut table = SlotTable::default();
        table.push(1);
        table.push(2);
        assert_eq!(table.drain().sum::<i32>(), 3);
        assert!(table.is_empty());
    }
}
