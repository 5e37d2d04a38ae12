// Copyright 2020 Joyent, Inc.

//! Match registry: which documents a subscriber can currently see.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::store::Doc;

pub type Predicate = Arc<dyn Fn(&Doc) -> bool + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    kinds: HashMap<String, HashMap<u64, Predicate>>,
}

/// Predicates grouped by document kind. A kind with no predicates is
/// removed, so an unknown kind never matches.
#[derive(Clone, Default)]
pub struct MatchRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl fmt::Debug for MatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MatchRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl MatchRegistry {
    pub fn new() -> MatchRegistry {
        MatchRegistry::default()
    }

    pub fn register<F>(&self, kind: &str, func: F) -> MatchHandle
    where
        F: Fn(&Doc) -> bool + Send + Sync + 'static,
    {
        let mut id = 0;
        if let Ok(mut reg) = self.inner.lock() {
            reg.next_id += 1;
            id = reg.next_id;
            reg.kinds
                .entry(kind.to_string())
                .or_default()
                .insert(id, Arc::new(func));
        }
        MatchHandle {
            registry: Arc::downgrade(&self.inner),
            kind: kind.to_string(),
            id,
        }
    }

    /// True if any predicate registered for the document's kind accepts it.
    pub fn has(&self, doc: &Doc) -> bool {
        let preds: Vec<Predicate> = match self.inner.lock() {
            Ok(reg) => match reg.kinds.get(&doc.kind) {
                Some(preds) => preds.values().cloned().collect(),
                None => return false,
            },
            Err(_) => return false,
        };
        preds.iter().any(|p| p(doc))
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.inner
            .lock()
            .map(|reg| reg.kinds.contains_key(kind))
            .unwrap_or(false)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .inner
            .lock()
            .map(|reg| reg.kinds.keys().cloned().collect())
            .unwrap_or_default();
        kinds.sort();
        kinds
    }
}

/// Registration of one predicate. Dropping the handle leaves the predicate
/// registered; call `stop` to remove it.
#[derive(Debug)]
pub struct MatchHandle {
    registry: Weak<Mutex<Registry>>,
    kind: String,
    id: u64,
}

impl MatchHandle {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn stop(&self) {
        let inner = match self.registry.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let mut reg = match inner.lock() {
            Ok(reg) => reg,
            Err(_) => return,
        };
        let now_empty = match reg.kinds.get_mut(&self.kind) {
            Some(preds) => {
                preds.remove(&self.id);
                preds.is_empty()
            }
            None => false,
        };
        if now_empty {
            reg.kinds.remove(&self.kind);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::value::{Map, Value};

    fn book(id: &str, pages: i32) -> Doc {
        let mut attrs = Map::new();
        attrs.insert("pages".into(), pages.into());
        Doc::new("Book", id, attrs)
    }

    fn pages(doc: &Doc) -> f64 {
        doc.get("pages").and_then(Value::as_f64).unwrap_or(0.0)
    }

    #[test]
    fn any_predicate_matches() {
        let reg = MatchRegistry::new();
        assert!(!reg.has(&book("1", 10)));

        let long = reg.register("Book", |doc| pages(doc) > 100.0);
        let short = reg.register("Book", |doc| pages(doc) < 5.0);
        assert!(reg.has(&book("1", 200)));
        assert!(reg.has(&book("1", 2)));
        assert!(!reg.has(&book("1", 50)));

        long.stop();
        assert!(!reg.has(&book("1", 200)));
        assert!(reg.has_kind("Book"));

        short.stop();
        assert!(!reg.has_kind("Book"));
        assert!(reg.kinds().is_empty());

        short.stop();
    }

    #[test]
    fn registries_are_independent() {
        let a = MatchRegistry::new();
        let b = MatchRegistry::new();
        let ha = a.register("Book", |_| true);
        let _hb = b.register("Book", |_| true);
        ha.stop();
        assert!(!a.has(&book("1", 1)));
        assert!(b.has(&book("1", 1)));
    }
}
