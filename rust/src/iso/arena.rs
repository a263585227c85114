// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed capacity slot tables addressed by generational handles.
//!
//! The slot index doubles as the HCI identifier for groups (CIG_ID,
//! BIG_Handle); the generation makes a handle to a released slot fail
//! every lookup, even after the index has been reused.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use slab::Slab;

pub struct Handle<T> {
    index: u8,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: usize, generation: u32) -> Self {
        Handle { index: index as u8, generation, _marker: PhantomData }
    }

    /// Slot index, used as the HCI identifier of the object.
    pub fn index(&self) -> u8 {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

pub struct Arena<T> {
    // Each value is stored with the generation of its handle.
    slots: Slab<(u32, T)>,
    capacity: usize,
    next_generation: u32,
}

/// Largest capacity addressable by an 8-bit index.
pub const MAX_CAPACITY: usize = u8::MAX as usize + 1;

impl<T> Arena<T> {
    /// `capacity` is at most [`MAX_CAPACITY`].
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_CAPACITY);
        Arena { slots: Slab::with_capacity(capacity), capacity, next_generation: 0 }
    }

    /// Insert a value built from its own handle. Returns `None` when every
    /// slot is taken.
    pub fn insert_with(&mut self, f: impl FnOnce(Handle<T>) -> T) -> Option<Handle<T>> {
        if self.slots.len() >= self.capacity {
            return None;
        }
        // Keys stay below the capacity: the slab only grows when it has no
        // vacant entry left.
        let entry = self.slots.vacant_entry();
        let generation = self.next_generation;
        self.next_generation = generation.wrapping_add(1);
        let handle = Handle::new(entry.key(), generation);
        entry.insert((generation, f(handle)));
        Some(handle)
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let index = handle.index as usize;
        match self.slots.get(index) {
            Some((generation, _)) if *generation == handle.generation => {
                self.slots.try_remove(index).map(|(_, value)| value)
            }
            _ => None,
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|(generation, _)| *generation == handle.generation)
            .map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|(generation, _)| *generation == handle.generation)
            .map(|(_, value)| value)
    }

    /// Resolve a raw identifier received from the controller into the
    /// handle of the live object using it, if any.
    pub fn lookup(&self, index: usize) -> Option<Handle<T>> {
        self.slots.get(index).map(|(generation, _)| Handle::new(index, *generation))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots
            .iter()
            .map(|(index, (generation, value))| (Handle::new(index, *generation), value))
    }

    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<Handle<T>> {
        self.iter().find(|(_, value)| predicate(value)).map(|(handle, _)| handle)
    }
}
