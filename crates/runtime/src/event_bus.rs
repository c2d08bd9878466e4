use std::cell::{Cell, RefCell};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Box<dyn FnMut(&E)>;

struct Registry<E> {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener<E>)>,
    removed_while_dispatching: Vec<ListenerId>,
    dispatching: bool,
}

/// Single-threaded typed event dispatch.
///
/// Listeners may subscribe or unsubscribe from inside a callback. Events
/// emitted from inside a callback are not delivered to the listeners of the
/// outer dispatch.
pub struct EventBus<E> {
    registry: RefCell<Registry<E>>,
    emitted: Cell<u64>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            registry: RefCell::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
                removed_while_dispatching: Vec::new(),
                dispatching: false,
            }),
            emitted: Cell::new(0),
        }
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("emitted", &self.emitted.get())
            .finish()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl FnMut(&E) + 'static) -> ListenerId {
        let mut reg = self.registry.borrow_mut();
        let id = ListenerId(reg.next_id);
        reg.next_id += 1;
        reg.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut reg = self.registry.borrow_mut();
        let before = reg.listeners.len();
        reg.listeners.retain(|(l, _)| *l != id);
        let removed = reg.listeners.len() != before;
        if !removed && reg.dispatching {
            reg.removed_while_dispatching.push(id);
            return true;
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.registry.borrow().listeners.len()
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.get()
    }

    pub fn emit(&self, event: &E) {
        self.emitted.set(self.emitted.get() + 1);

        let mut active = {
            let mut reg = self.registry.borrow_mut();
            if reg.dispatching {
                return;
            }
            reg.dispatching = true;
            std::mem::take(&mut reg.listeners)
        };

        for (_, listener) in active.iter_mut() {
            listener(event);
        }

        let mut reg = self.registry.borrow_mut();
        let removed = std::mem::take(&mut reg.removed_while_dispatching);
        active.retain(|(id, _)| !removed.contains(id));
        active.append(&mut reg.listeners);
        reg.listeners = active;
        reg.dispatching = false;
    }
}
