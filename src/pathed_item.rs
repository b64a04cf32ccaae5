use std::{
    ops::{Deref, DerefMut},
    path::Path,
};

/// An item tagged with the path it was loaded from.
#[derive(Debug)]
pub struct PathedItem<P: AsRef<Path>, T> {
    /// The path for the item.
    path: P,

    /// The item value.
    item: T,
}

impl<P: AsRef<Path>, T> PathedItem<P, T> {
    pub fn new(path: P, item: T) -> PathedItem<P, T> {
        Self { path, item }
    }

    /// Returns a reference to the path for this item.
    pub fn path(&self) -> &P {
        &self.path
    }

    /// Splits the item into its path and value.
    pub fn into_parts(self) -> (P, T) {
        (self.path, self.item)
    }
}

impl<P: AsRef<Path>, T> Deref for PathedItem<P, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<P: AsRef<Path>, T> DerefMut for PathedItem<P, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.item
    }
}
