// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed intent registry.
//!
//! Each entry carries three flags:
//!
//! | Flag | Meaning |
//! |------|---------|
//! | `expected_registered` (E) | the application wants this present on the server |
//! | `registered` (R) | the server confirmed it on the current connection |
//! | `unregistering` (U) | a removal has been requested and not yet confirmed |
//!
//! The action the worker takes is derived from the flags, never stored:
//!
//! ```text
//!  E && !R        -> Register
//! !E &&  R &&  U  -> Unregister
//! !E && !R && !U  -> Remove (drop the bookkeeping)
//!  otherwise      -> None
//! ```

use dashmap::DashMap;

/// Action the redo worker takes for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedoType {
    None,
    Register,
    Unregister,
    Remove,
}

impl RedoType {
    /// Derive the action from the three flags.
    pub fn derive(expected_registered: bool, registered: bool, unregistering: bool) -> Self {
        match (expected_registered, registered, unregistering) {
            (true, false, _) => Self::Register,
            (false, true, true) => Self::Unregister,
            (false, false, false) => Self::Remove,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::Remove => "remove",
        }
    }
}

/// One recorded intent.
#[derive(Debug, Clone, PartialEq)]
pub struct RedoData<T> {
    pub key: String,
    pub data: T,
    pub expected_registered: bool,
    pub registered: bool,
    pub unregistering: bool,
}

impl<T> RedoData<T> {
    pub fn new(key: impl Into<String>, data: T) -> Self {
        Self {
            key: key.into(),
            data,
            expected_registered: true,
            registered: false,
            unregistering: false,
        }
    }

    pub fn redo_type(&self) -> RedoType {
        RedoType::derive(self.expected_registered, self.registered, self.unregistering)
    }
}

/// Concurrent map of intents for one resource kind.
///
/// Same-key operations serialize on the map's shard lock; different keys are
/// independent.
#[derive(Debug)]
pub struct RedoRegistry<T> {
    kind: &'static str,
    entries: DashMap<String, RedoData<T>>,
}

impl<T: Clone> RedoRegistry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Record intent. Replaces any previous entry, so a re-register after a
    /// deregister is replayed.
    pub fn cache_for_redo(&self, key: &str, data: T) {
        self.entries.insert(key.to_string(), RedoData::new(key, data));
    }

    pub fn mark_registered(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.registered = true;
        }
    }

    /// The application no longer wants this entry.
    pub fn mark_unregistering(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expected_registered = false;
            entry.unregistering = true;
        }
    }

    /// The server confirmed the removal.
    pub fn mark_unregistered(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.registered = false;
            entry.unregistering = false;
        }
    }

    pub fn remove(&self, key: &str) -> Option<RedoData<T>> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    /// Remove only if nothing is left to do for the key. A key that was
    /// re-registered in the meantime is kept.
    pub fn remove_if_unwound(&self, key: &str) -> bool {
        self.entries
            .remove_if(key, |_, entry| !entry.expected_registered && !entry.registered)
            .is_some()
    }

    /// Point-in-time snapshot of entries with something to do.
    pub fn find_pending(&self) -> Vec<RedoData<T>> {
        self.entries
            .iter()
            .filter(|entry| entry.redo_type() != RedoType::None)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// The connection dropped: nothing is registered any more.
    ///
    /// Entries that were being removed also lose their `unregistering` flag,
    /// since the server dropped them with the connection; they become
    /// `Remove`.
    pub fn on_disconnect(&self) {
        for mut entry in self.entries.iter_mut() {
            entry.registered = false;
            if !entry.expected_registered && entry.unregistering {
                entry.unregistering = false;
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<RedoData<T>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.entries.get(key).map(|entry| entry.registered).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}
