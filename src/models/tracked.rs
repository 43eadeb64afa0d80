//! # Attribute Change Tracking
//!
//! [`Tracked`] keeps the persisted value of an attribute next to its current
//! in-memory value, so callers can ask whether an attribute was assigned
//! (`is_touched`), whether it differs from what the store holds
//! (`is_changed`), and what it used to be (`was`).
//!
//! Models hold one `Tracked` per mutable column; stores call
//! [`Tracked::commit`] once a write has been persisted.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq)]
pub struct Tracked<T> {
    persisted: T,
    current: T,
    touched: bool,
}

impl<T: Clone + PartialEq> Tracked<T> {
    /// Wrap a value that matches what is persisted
    pub fn new(value: T) -> Self {
        Self {
            persisted: value.clone(),
            current: value,
            touched: false,
        }
    }

    pub fn get(&self) -> &T {
        &self.current
    }

    /// Assign a new value. Assigning the persisted value still counts as a touch.
    pub fn set(&mut self, value: T) {
        self.current = value;
        self.touched = true;
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }

    pub fn is_changed(&self) -> bool {
        self.current != self.persisted
    }

    /// The last persisted value
    pub fn was(&self) -> &T {
        &self.persisted
    }

    /// `(was, now)` when the value changed
    pub fn change(&self) -> Option<(&T, &T)> {
        self.is_changed().then_some((&self.persisted, &self.current))
    }

    /// Mark the current value as persisted
    pub fn commit(&mut self) {
        self.persisted = self.current.clone();
        self.touched = false;
    }

    /// Discard the in-memory assignment
    pub fn revert(&mut self) {
        self.current = self.persisted.clone();
        self.touched = false;
    }
}

impl<T: Copy + PartialEq> Tracked<T> {
    pub fn value(&self) -> T {
        self.current
    }
}

impl<T: Serialize> Serialize for Tracked<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.current.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de> + Clone + PartialEq> Deserialize<'de> for Tracked<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Tracked::new)
    }
}
