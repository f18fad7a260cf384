use crate::{Error, SubcircId, MAX_SUBCIRCS};

const MAX_CAPACITY: usize = MAX_SUBCIRCS;
const DEFAULT_CAPACITY: usize = if MAX_CAPACITY < 8 { MAX_CAPACITY } else { 8 };

/// Resizable sparse array which stores values at fixed indices.
///
/// Unlike an ordinary vector, an element keeps its index for its whole
/// lifetime and removal leaves a hole instead of compacting.
#[derive(Debug)]
pub struct SubcircList<T> {
    slots: Vec<Option<T>>,
    len: usize,
    max_index: Option<SubcircId>,
}

impl<T> Default for SubcircList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubcircList<T> {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(DEFAULT_CAPACITY);
        slots.resize_with(DEFAULT_CAPACITY, || None);

        Self {
            slots,
            len: 0,
            max_index: None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Greatest index currently occupied.
    pub fn max_index(&self) -> Option<SubcircId> {
        self.max_index
    }

    fn ensure_capacity(&mut self, id: SubcircId) {
        let index = id.index();
        debug_assert!(index < MAX_CAPACITY);

        if index < self.slots.len() {
            return;
        }

        let mut capacity = self.slots.len();
        if index >= MAX_CAPACITY / 2 {
            capacity = MAX_CAPACITY;
        } else {
            while index >= capacity {
                capacity *= 2;
            }
        }

        self.slots.resize_with(capacity, || None);
    }

    /// Store `value` at index `id`.
    ///
    /// The slot must be empty and the index below [`MAX_SUBCIRCS`].
    pub fn add(&mut self, id: SubcircId, value: T) -> Result<(), Error> {
        if id.index() >= MAX_CAPACITY {
            return Err(Error::CapacityExceeded("sub-circuit index out of range"));
        }

        self.ensure_capacity(id);

        if self.slots[id.index()].is_some() {
            return Err(Error::Protocol("sub-circuit index already in use"));
        }

        self.slots[id.index()] = Some(value);
        self.len += 1;

        if self.max_index.map_or(true, |max| max < id) {
            self.max_index = Some(id);
        }

        Ok(())
    }

    /// Remove and return the element at index `id`, if any.
    pub fn remove(&mut self, id: SubcircId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        let value = slot.take()?;

        self.len -= 1;

        if self.len == 0 {
            self.max_index = None;
        } else if self.max_index == Some(id) {
            // scan downward for the next occupied slot
            self.max_index = (0..id.index())
                .rev()
                .find(|i| self.slots[*i].is_some())
                .map(|i| SubcircId::new(i as u8));
            debug_assert!(self.max_index.is_some());
        }

        Some(value)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.len = 0;
        self.max_index = None;
    }

    pub fn get(&self, id: SubcircId) -> Option<&T> {
        self.slots.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: SubcircId) -> Option<&mut T> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    pub fn contains(&self, id: SubcircId) -> bool {
        self.get(id).is_some()
    }

    /// Occupied indices in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = SubcircId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| SubcircId::new(i as u8))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubcircId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (SubcircId::new(i as u8), v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SubcircId, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (SubcircId::new(i as u8), v)))
    }
}
