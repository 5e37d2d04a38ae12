// Copyright 2020 Joyent, Inc.

//! Document storage seen by the session layer.
//!
//! The session layer only needs lookup, insert/update/remove and a change
//! hook; `MemoryStore` provides that in memory for clients and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::value::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Doc {
    pub kind: String,
    pub id: String,
    pub attrs: Map,
}

impl Doc {
    pub fn new<K: Into<String>, I: Into<String>>(kind: K, id: I, attrs: Map) -> Doc {
        Doc {
            kind: kind.into(),
            id: id.into(),
            attrs,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attrs.get(field)
    }

    /// Applies `changes`; an `Undefined` value removes the field. Returns
    /// the fields that actually changed with their new values.
    pub fn apply(&mut self, changes: &Map) -> Map {
        let mut applied = Map::new();
        for (k, v) in changes {
            let same = match (self.attrs.get(k), v) {
                (None, Value::Undefined) => true,
                (Some(old), v) => old.identical(v),
                (None, _) => false,
            };
            if same {
                continue;
            }
            if v.is_undefined() {
                self.attrs.remove(k);
            } else {
                self.attrs.insert(k.clone(), v.clone());
            }
            applied.insert(k.clone(), v.clone());
        }
        applied
    }
}

/// Field differences from `was` to `now`; removed fields map to `Undefined`.
pub fn diff(was: &Map, now: &Map) -> Map {
    let mut changes = Map::new();
    for (k, v) in now {
        match was.get(k) {
            Some(old) if old.identical(v) => (),
            _ => {
                changes.insert(k.clone(), v.clone());
            }
        }
    }
    for k in was.keys() {
        if !now.contains_key(k) {
            changes.insert(k.clone(), Value::Undefined);
        }
    }
    changes
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocChange {
    Added(Doc),
    /// `changes` holds the new values of the changed fields.
    Changed { doc: Doc, was: Doc, changes: Map },
    Removed(Doc),
}

impl DocChange {
    pub fn doc(&self) -> &Doc {
        match self {
            DocChange::Added(doc) | DocChange::Removed(doc) => doc,
            DocChange::Changed { doc, .. } => doc,
        }
    }

    pub fn kind(&self) -> &str {
        &self.doc().kind
    }
}

pub type ChangeListener = Arc<dyn Fn(&DocChange) + Send + Sync>;

pub trait DocStore: Send + Sync {
    fn find(&self, kind: &str, id: &str) -> Option<Doc>;

    fn docs(&self, kind: &str) -> Vec<Doc>;

    /// Inserts `doc`, replacing any document with the same id.
    fn insert(&self, doc: Doc) -> Option<DocChange>;

    fn update(&self, kind: &str, id: &str, changes: &Map) -> Option<DocChange>;

    fn remove(&self, kind: &str, id: &str) -> Option<DocChange>;

    fn on_change(&self, listener: ChangeListener) -> u64;

    fn stop_on_change(&self, handle: u64);
}

#[derive(Default)]
pub struct MemoryStore {
    kinds: Mutex<HashMap<String, BTreeMap<String, Doc>>>,
    listeners: Mutex<BTreeMap<u64, ChangeListener>>,
    next_listener: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn notify(&self, change: Option<DocChange>) -> Option<DocChange> {
        if let Some(change) = &change {
            let listeners: Vec<ChangeListener> = match self.listeners.lock() {
                Ok(l) => l.values().cloned().collect(),
                Err(_) => Vec::new(),
            };
            for listener in listeners {
                listener(change);
            }
        }
        change
    }

    fn with_kinds<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut HashMap<String, BTreeMap<String, Doc>>) -> Option<T>,
    {
        let mut kinds = self.kinds.lock().ok()?;
        f(&mut kinds)
    }
}

impl DocStore for MemoryStore {
    fn find(&self, kind: &str, id: &str) -> Option<Doc> {
        self.with_kinds(|kinds| kinds.get(kind)?.get(id).cloned())
    }

    fn docs(&self, kind: &str) -> Vec<Doc> {
        self.with_kinds(|kinds| {
            Some(kinds.get(kind)?.values().cloned().collect())
        })
        .unwrap_or_default()
    }

    fn insert(&self, doc: Doc) -> Option<DocChange> {
        let change = self.with_kinds(|kinds| {
            let docs = kinds.entry(doc.kind.clone()).or_default();
            match docs.insert(doc.id.clone(), doc.clone()) {
                Some(was) => {
                    let changes = diff(&was.attrs, &doc.attrs);
                    if changes.is_empty() {
                        None
                    } else {
                        Some(DocChange::Changed { doc, was, changes })
                    }
                }
                None => Some(DocChange::Added(doc)),
            }
        });
        self.notify(change)
    }

    fn update(&self, kind: &str, id: &str, changes: &Map) -> Option<DocChange> {
        let change = self.with_kinds(|kinds| {
            let doc = kinds.get_mut(kind)?.get_mut(id)?;
            let was = doc.clone();
            let applied = doc.apply(changes);
            if applied.is_empty() {
                return None;
            }
            Some(DocChange::Changed {
                doc: doc.clone(),
                was,
                changes: applied,
            })
        });
        self.notify(change)
    }

    fn remove(&self, kind: &str, id: &str) -> Option<DocChange> {
        let change = self.with_kinds(|kinds| {
            let docs = kinds.get_mut(kind)?;
            let doc = docs.remove(id)?;
            if docs.is_empty() {
                kinds.remove(kind);
            }
            Some(DocChange::Removed(doc))
        });
        self.notify(change)
    }

    fn on_change(&self, listener: ChangeListener) -> u64 {
        let handle = self.next_listener.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(handle, listener);
        }
        handle
    }

    fn stop_on_change(&self, handle: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(&handle);
        }
    }
}
