use std::collections::VecDeque;

/// A FIFO queue of values of type `T`, either bounded or unbounded.
///
/// Pushing to a full bounded queue fails and hands the value back to the
/// caller, so components can react to back-pressure instead of losing
/// messages.
pub struct Queue<T> {
    inner: VecDeque<T>,
    capacity: Option<usize>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self {
            inner: VecDeque::new(),
            capacity: None,
        }
    }
}

impl<T> Queue<T> {
    /// Creates a queue holding at most `capacity` elements.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            inner: VecDeque::with_capacity(capacity),
            capacity: Some(capacity),
        }
    }

    /// Appends an element at the back of the queue.
    ///
    /// # Errors
    ///
    /// If the queue is full, the element is returned back in the `Err`
    /// variant.
    pub fn push_back(&mut self, element: T) -> Result<(), T> {
        match self.capacity {
            Some(capacity) if self.inner.len() >= capacity => Err(element),
            _ => {
                self.inner.push_back(element);
                Ok(())
            }
        }
    }

    /// Removes and returns the element at the front, or `None` if empty.
    pub fn pop_front(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    /// The number of elements currently in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// `true` if the queue holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unbounded_queue() {
        let mut queue = Queue::default();
        assert!(queue.is_empty());
        for n in 0..100 {
            assert!(queue.push_back(n).is_ok());
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.pop_front(), Some(0));
        assert_eq!(queue.len(), 99);
    }

    #[test]
    fn test_bounded_queue_rejects_when_full() {
        let mut queue = Queue::bounded(2);
        assert!(queue.push_back('a').is_ok());
        assert!(queue.push_back('b').is_ok());
        assert_eq!(queue.push_back('c'), Err('c'));
        assert_eq!(queue.pop_front(), Some('a'));
        assert!(queue.push_back('c').is_ok());
    }
}
