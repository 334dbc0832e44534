use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Order numbers handed to the dispatcher whose outcome the reducer has not
/// yet taken. Shared by the source and the reducer of one run.
///
/// The source renews these claims on every tick and never dispatches a
/// number that is still present, so an order is fetched by at most one
/// worker at a time even when its claim comes back through the staleness
/// sweep.
#[derive(Debug, Default)]
pub struct InFlightOrders {
    numbers: Mutex<HashSet<String>>,
}

impl InFlightOrders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `number` as in flight. Returns `false` if it already was.
    pub fn insert(&self, number: &str) -> bool {
        self.lock().insert(number.to_owned())
    }

    pub fn remove(&self, number: &str) -> bool {
        self.lock().remove(number)
    }

    pub fn contains(&self, number: &str) -> bool {
        self.lock().contains(number)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Numbers currently in flight, in no particular order.
    pub fn numbers(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    // The set holds no invariant a panicking holder could break halfway.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.numbers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
