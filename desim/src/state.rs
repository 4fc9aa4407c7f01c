use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use rand::RngCore;

use crate::Queue;

/// A type-safe key used to fetch values from the value store.
///
/// # Construction
///
/// A key can be constructed only by calling [`State::insert`], which assigns
/// a fresh numerical ID to the inserted value. The key also carries a hash
/// unique to the issuing [`State`], so using it with a different state
/// instance panics:
///
/// ```should_panic
/// # use desim::State;
/// let mut state_1 = State::default();
/// let mut state_2 = State::default();
/// let key = state_1.insert(1);
/// let _ = state_2.remove(key);
/// ```
///
/// # Type Safety
///
/// A key issued for a value of type `V` cannot be used to access a value of
/// another type; `V` is a marker only, and no values of type `V` are stored
/// in the key itself.
///
/// ```compile_fail
/// # use desim::State;
/// let mut state = State::default();
/// let key = state.insert(String::from("1"));
/// let _: Option<i32> = state.remove(key); // Error!
/// ```
#[derive(Debug)]
pub struct Key<V> {
    id: usize,
    state_hash: u64,
    _marker: PhantomData<V>,
}

// Manual impls: the derived ones would bound `V`, but `V` is a marker only.
impl<V> Clone for Key<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state_hash: self.state_hash,
            _marker: PhantomData,
        }
    }
}
impl<V> Copy for Key<V> {}
impl<V> PartialEq for Key<V> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.state_hash == other.state_hash
    }
}
impl<V> Eq for Key<V> {}
impl<V> Hash for Key<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.state_hash.hash(state);
    }
}

/// A type-safe identifier of a queue.
///
/// This is an analogue of [`Key<V>`](Key) used specifically for queues.
#[derive(Debug)]
pub struct QueueId<V> {
    id: usize,
    state_hash: u64,
    _marker: PhantomData<V>,
}

impl<V> Clone for QueueId<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state_hash: self.state_hash,
            _marker: PhantomData,
        }
    }
}
impl<V> Copy for QueueId<V> {}
impl<V> PartialEq for QueueId<V> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.state_hash == other.state_hash
    }
}
impl<V> Eq for QueueId<V> {}
impl<V> Hash for QueueId<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.state_hash.hash(state);
    }
}

/// State of a simulation holding all queues and arbitrary values in a value
/// store.
pub struct State {
    store: HashMap<TypeId, HashMap<usize, Box<dyn Any>>>,
    queues: HashMap<TypeId, HashMap<usize, Box<dyn Any>>>,
    next_id: usize,
    state_hash: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            store: HashMap::new(),
            queues: HashMap::new(),
            next_id: 0,
            state_hash: rand::thread_rng().next_u64(),
        }
    }
}

impl State {
    fn assert_hash(&self, key_hash: u64) {
        assert_eq!(
            key_hash, self.state_hash,
            "State hash of the key does not match the hash of the state"
        );
    }

    /// Inserts an arbitrary value to the value store. Learn more in the
    /// documentation for [`Key`].
    #[must_use = "Discarding key results in leaking inserted value"]
    pub fn insert<V: 'static>(&mut self, value: V) -> Key<V> {
        let id = self.next_id;
        self.next_id += 1;
        self.store
            .entry(TypeId::of::<V>())
            .or_default()
            .insert(id, Box::new(value));
        Key {
            id,
            state_hash: self.state_hash,
            _marker: PhantomData,
        }
    }

    /// Removes a value of type `V` from the value store. Learn more in the
    /// documentation for [`Key`].
    pub fn remove<V: 'static>(&mut self, key: Key<V>) -> Option<V> {
        self.assert_hash(key.state_hash);
        self.store
            .get_mut(&TypeId::of::<V>())
            .and_then(|m| m.remove(&key.id).map(|v| *v.downcast::<V>().unwrap()))
    }

    /// Gets an immutable reference to a value of type `V` from the value
    /// store. Learn more in the documentation for [`Key`].
    #[must_use]
    pub fn get<V: 'static>(&self, key: Key<V>) -> Option<&V> {
        self.assert_hash(key.state_hash);
        self.store
            .get(&TypeId::of::<V>())
            .and_then(|m| m.get(&key.id).map(|v| v.downcast_ref::<V>().unwrap()))
    }

    /// Gets a mutable reference to a value of type `V` from the value store.
    /// Learn more in the documentation for [`Key`].
    #[must_use]
    pub fn get_mut<V: 'static>(&mut self, key: Key<V>) -> Option<&mut V> {
        self.assert_hash(key.state_hash);
        self.store
            .get_mut(&TypeId::of::<V>())
            .and_then(|m| m.get_mut(&key.id).map(|v| v.downcast_mut::<V>().unwrap()))
    }

    /// Creates a new unbounded queue, returning its ID.
    pub fn new_queue<V: 'static>(&mut self) -> QueueId<V> {
        self.register_queue(Queue::<V>::default())
    }

    /// Creates a new bounded queue, returning its ID.
    pub fn new_bounded_queue<V: 'static>(&mut self, capacity: usize) -> QueueId<V> {
        self.register_queue(Queue::<V>::bounded(capacity))
    }

    fn register_queue<V: 'static>(&mut self, queue: Queue<V>) -> QueueId<V> {
        let id = self.next_id;
        self.next_id += 1;
        self.queues
            .entry(TypeId::of::<V>())
            .or_default()
            .insert(id, Box::new(queue));
        QueueId {
            id,
            state_hash: self.state_hash,
            _marker: PhantomData,
        }
    }

    fn queue_mut<V: 'static>(&mut self, queue: QueueId<V>) -> &mut Queue<V> {
        self.assert_hash(queue.state_hash);
        self.queues
            .get_mut(&TypeId::of::<V>())
            .expect("If queue ID was issued for this type, it must exist")
            .get_mut(&queue.id)
            .expect("If this queue ID was issued, a corresponding queue must exist")
            .downcast_mut::<Queue<V>>()
            .unwrap()
    }

    fn queue<V: 'static>(&self, queue: QueueId<V>) -> &Queue<V> {
        self.assert_hash(queue.state_hash);
        self.queues
            .get(&TypeId::of::<V>())
            .expect("If queue ID was issued for this type, it must exist")
            .get(&queue.id)
            .expect("If this queue ID was issued, a corresponding queue must exist")
            .downcast_ref::<Queue<V>>()
            .unwrap()
    }

    /// Sends `value` to the `queue`.
    ///
    /// # Errors
    ///
    /// If the queue is full, the value is handed back in the `Err` variant.
    pub fn send<V: 'static>(&mut self, queue: QueueId<V>, value: V) -> Result<(), V> {
        self.queue_mut(queue).push_back(value)
    }

    /// Pops the first value from the `queue`, or `None` if it is empty.
    pub fn recv<V: 'static>(&mut self, queue: QueueId<V>) -> Option<V> {
        self.queue_mut(queue).pop_front()
    }

    /// Checks the number of elements in the queue.
    #[must_use]
    pub fn len<V: 'static>(&self, queue: QueueId<V>) -> usize {
        self.queue(queue).len()
    }

    /// `true` if the queue holds no elements.
    #[must_use]
    pub fn is_empty<V: 'static>(&self, queue: QueueId<V>) -> bool {
        self.queue(queue).is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_remove_key_values() {
        let mut state = State::default();

        let id = state.insert(1);
        assert_eq!(state.remove(id), Some(1));
        assert_eq!(state.remove(id), None);

        let id = state.insert("string_slice");
        assert_eq!(state.remove(id), Some("string_slice"));
        assert_eq!(state.remove(id), None);

        let id = state.insert(vec![String::from("S")]);
        assert_eq!(state.remove(id), Some(vec![String::from("S")]));
        assert_eq!(state.remove(id), None);
    }

    #[test]
    fn test_get_and_modify_in_place() {
        let mut state = State::default();
        let id = state.insert(vec![1, 2, 3]);
        state.get_mut(id).unwrap().push(4);
        assert_eq!(state.get(id), Some(&vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_bounded_queue_returns_value_when_full() {
        let mut state = State::default();
        let qid = state.new_bounded_queue::<&str>(2);
        assert_eq!(state.len(qid), 0);
        assert!(state.is_empty(qid));

        assert!(state.send(qid, "A").is_ok());
        assert!(state.send(qid, "B").is_ok());
        assert_eq!(state.send(qid, "C"), Err("C"));

        assert_eq!(state.recv(qid), Some("A"));
        assert_eq!(state.recv(qid), Some("B"));
        assert_eq!(state.recv(qid), None);
    }

    #[test]
    fn test_unbounded_queue() {
        let mut state = State::default();
        let qid = state.new_queue::<&str>();

        assert!(state.send(qid, "A").is_ok());
        assert!(state.send(qid, "B").is_ok());
        assert!(state.send(qid, "C").is_ok());
        assert_eq!(state.len(qid), 3);

        assert_eq!(state.recv(qid), Some("A"));
        assert_eq!(state.recv(qid), Some("B"));
        assert_eq!(state.recv(qid), Some("C"));
        assert_eq!(state.recv(qid), None);
    }

    #[test]
    fn test_keys_are_hashable_for_any_value_type() {
        // The stored type implements neither `Hash` nor `Eq`; the key must
        // still work as a map key.
        #[derive(Debug)]
        struct Opaque(f64);

        let mut state = State::default();
        let key_1 = state.insert(Opaque(1.0));
        let key_2 = state.insert(Opaque(2.0));

        let mut map = HashMap::new();
        map.insert(key_1, "first");
        map.insert(key_2, "second");
        assert_eq!(map.get(&key_1), Some(&"first"));
        assert_eq!(map.remove(&key_2), Some("second"));
        assert_eq!(map.get(&key_2), None);
    }

    #[test]
    #[should_panic(expected = "State hash of the key does not match")]
    fn test_key_from_another_state_panics() {
        let mut state_1 = State::default();
        let mut state_2 = State::default();
        let key = state_1.insert(1);
        let _ = state_2.remove(key);
    }
}
