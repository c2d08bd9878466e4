/// Generational handle: `(index, generation)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32, u32);

impl Handle {
    pub fn new(index: u32, generation: u32) -> Self {
        Handle(index, generation)
    }

    pub fn index(self) -> u32 {
        self.0
    }

    pub fn generation(self) -> u32 {
        self.1
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slab keyed by generational handles.
///
/// Freed slots are reused with a bumped generation, so stale handles never
/// resolve to a newer value.
#[derive(Debug)]
pub struct HandleSlab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for HandleSlab<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> HandleSlab<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index() as usize)
            .filter(|s| s.generation == handle.generation())
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|s| s.generation == handle.generation())
            .and_then(|s| s.value.as_mut())
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self
            .slots
            .get_mut(handle.index() as usize)
            .filter(|s| s.generation == handle.generation())?;
        let value = slot.value.take()?;
        self.free.push(handle.index());
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value
                .as_ref()
                .map(|v| (Handle::new(i as u32, s.generation), v))
        })
    }
}
