use std::sync::Arc;

use smallvec::SmallVec;
use tokio::sync::watch;

/// A namespace selection value with its generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selected {
    pub generation: u64,
    /// Sorted, deduplicated. Empty means every namespace.
    pub namespaces: SmallVec<[String; 4]>,
}

impl Selected {
    pub fn is_all(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn contains(&self, ns: &str) -> bool {
        self.is_all() || self.namespaces.iter().any(|n| n == ns)
    }
}

/// Namespaces the operator chose to view, shared by every store.
///
/// Written by whoever owns the namespace picker, read by store views.
/// Every change bumps the generation so derived views know to recompute.
#[derive(Clone)]
pub struct NamespaceSelection {
    tx: Arc<watch::Sender<Selected>>,
}

impl Default for NamespaceSelection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NamespaceSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NamespaceSelection").field(&*self.tx.borrow()).finish()
    }
}

impl NamespaceSelection {
    /// Selection covering all namespaces.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Selected::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn with<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sel = Self::new();
        sel.set(namespaces);
        sel
    }

    pub fn set<I, S>(&self, namespaces: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: SmallVec<[String; 4]> = namespaces.into_iter().map(Into::into).filter(|s: &String| !s.is_empty()).collect();
        list.sort_unstable();
        list.dedup();
        self.tx.send_modify(|cur| {
            cur.generation += 1;
            cur.namespaces = list;
        });
    }

    /// Back to all namespaces.
    pub fn clear(&self) {
        self.set(std::iter::empty::<String>());
    }

    pub fn current(&self) -> Selected {
        self.tx.borrow().clone()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.tx.borrow().namespaces.to_vec()
    }

    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }

    pub fn contains(&self, ns: &str) -> bool {
        self.tx.borrow().contains(ns)
    }

    pub fn subscribe(&self) -> watch::Receiver<Selected> {
        self.tx.subscribe()
    }
}
