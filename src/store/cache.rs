//! Per-owner query cache with generation-checked commits.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Observable state of one owner's collection.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<E> {
    pub data: Vec<E>,
    pub loading: bool,
    pub error: Option<String>,
    /// True until the first successful fetch and after every invalidation.
    pub stale: bool,
}

impl<E> Default for QueryState<E> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            loading: false,
            error: None,
            stale: true,
        }
    }
}

struct Entry<E> {
    generation: u64,
    state: watch::Sender<QueryState<E>>,
}

impl<E> Entry<E> {
    fn new(generation: u64) -> Self {
        let (state, _) = watch::channel(QueryState::default());
        Self { generation, state }
    }
}

/// A fetch in progress, tagged with the generation it started under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchTicket(u64);

struct Entries<E> {
    /// Generations are unique across the cache, so a ticket issued to an
    /// evicted entry never matches the entry that replaces it.
    next_generation: u64,
    map: HashMap<String, Entry<E>>,
}

impl<E> Entries<E> {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn get_or_insert(&mut self, owner: &str) -> &mut Entry<E> {
        let next_generation = &mut self.next_generation;
        self.map.entry(owner.to_string()).or_insert_with(|| {
            *next_generation += 1;
            Entry::new(*next_generation)
        })
    }
}

/// Entries nobody watches are evicted when they are invalidated, so the map
/// only holds owners that are watched or were fetched since their last
/// invalidation.
pub(crate) struct QueryCache<E> {
    entries: Mutex<Entries<E>>,
}

impl<E: Clone> QueryCache<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                next_generation: 0,
                map: HashMap::new(),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries<E>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn watch(&self, owner: &str) -> watch::Receiver<QueryState<E>> {
        self.entries().get_or_insert(owner).state.subscribe()
    }

    /// Cached rows when they are neither stale nor errored.
    pub(crate) fn fresh(&self, owner: &str) -> Option<Vec<E>> {
        let entries = self.entries();
        let state = entries.map.get(owner)?.state.borrow();
        (!state.stale && state.error.is_none()).then(|| state.data.clone())
    }

    pub(crate) fn begin_fetch(&self, owner: &str) -> FetchTicket {
        let mut entries = self.entries();
        let entry = entries.get_or_insert(owner);
        entry.state.send_if_modified(|state| !std::mem::replace(&mut state.loading, true));
        FetchTicket(entry.generation)
    }

    /// Store a fetch result unless the owner was invalidated meanwhile.
    /// Returns whether the result was kept.
    pub(crate) fn commit(
        &self,
        owner: &str,
        ticket: FetchTicket,
        result: Result<Vec<E>, String>,
    ) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.map.get_mut(owner) else {
            return false;
        };
        if entry.generation != ticket.0 {
            return false;
        }
        entry.state.send_modify(|state| {
            state.loading = false;
            match result {
                Ok(data) => {
                    state.data = data;
                    state.error = None;
                    state.stale = false;
                }
                Err(message) => state.error = Some(message),
            }
        });
        true
    }

    pub(crate) fn invalidate(&self, owner: &str) {
        let mut entries = self.entries();
        let Some(entry) = entries.map.get(owner) else {
            return;
        };
        if entry.state.receiver_count() == 0 {
            entries.map.remove(owner);
            return;
        }
        let generation = entries.bump();
        if let Some(entry) = entries.map.get_mut(owner) {
            Self::invalidate_entry(entry, generation);
        }
    }

    pub(crate) fn invalidate_all(&self) {
        let mut entries = self.entries();
        entries.map.retain(|_, entry| entry.state.receiver_count() > 0);
        let generation = entries.bump();
        for entry in entries.map.values_mut() {
            Self::invalidate_entry(entry, generation);
        }
    }

    fn invalidate_entry(entry: &mut Entry<E>, generation: u64) {
        // Any fetch under the old generation will be discarded.
        entry.generation = generation;
        entry.state.send_modify(|state| {
            state.stale = true;
            state.loading = false;
        });
    }

    /// Owners someone is currently watching.
    pub(crate) fn watched_owners(&self) -> Vec<String> {
        self.entries()
            .map
            .iter()
            .filter(|(_, entry)| entry.state.receiver_count() > 0)
            .map(|(owner, _)| owner.clone())
            .collect()
    }
}
