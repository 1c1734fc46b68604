//! In-process document store.
//!
//! Documents live in arena slots addressed by a stable index; an id→slot map
//! per collection gives O(1) lookup. Iteration is always in slot order, so
//! results never depend on hash-map ordering. Used by tests and for
//! ephemeral engines that need no persistence.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;

use crate::{
    document::{Collection, DocFilter, Document},
    error::{KnowledgeError, Result},
    store::{DocumentStore, query_terms},
    taxonomy::tokenize,
};

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Document>>,
    index: HashMap<String, usize>,
}

impl Arena {
    fn live(&self) -> impl Iterator<Item = &Document> {
        self.slots.iter().flatten()
    }

    fn get(&self, id: &str) -> Option<&Document> {
        self.index.get(id).and_then(|&slot| self.slots[slot].as_ref())
    }

    fn insert(&mut self, doc: Document) {
        self.index.insert(doc.id().to_string(), self.slots.len());
        self.slots.push(Some(doc));
    }

    fn replace(&mut self, slot: usize, doc: Document) {
        self.slots[slot] = Some(doc);
    }

    fn remove_oldest(&mut self, n: usize) -> usize {
        let mut order: Vec<(usize, chrono::DateTime<chrono::Utc>)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, doc)| doc.as_ref().map(|d| (slot, d.created_at)))
            .collect();
        order.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut removed = 0;
        for (slot, _) in order.into_iter().take(n) {
            if let Some(doc) = self.slots[slot].take() {
                self.index.remove(doc.id());
                removed += 1;
            }
        }
        if self.slots.len() > 2 * self.index.len() {
            self.compact();
        }
        removed
    }

    /// Drop tombstones, keeping insertion order, and rebuild the index.
    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        self.index = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, doc)| doc.as_ref().map(|d| (d.id().to_string(), slot)))
            .collect();
    }
}

#[derive(Default)]
struct Collections {
    knowledge: Arena,
    conversations: Arena,
}

impl Collections {
    fn arena(&self, collection: Collection) -> &Arena {
        match collection {
            Collection::KnowledgeBase => &self.knowledge,
            Collection::Conversations => &self.conversations,
        }
    }

    fn arena_mut(&mut self, collection: Collection) -> &mut Arena {
        match collection {
            Collection::KnowledgeBase => &mut self.knowledge,
            Collection::Conversations => &mut self.conversations,
        }
    }
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: RwLock<Collections>,
    offline: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backend: every call fails while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(KnowledgeError::backend("memory store is offline"));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Collections>> {
        self.check_online()?;
        self.inner
            .read()
            .map_err(|_| KnowledgeError::backend("memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Collections>> {
        self.check_online()?;
        self.inner
            .write()
            .map_err(|_| KnowledgeError::backend("memory store lock poisoned"))
    }
}

fn keyword_score(doc: &Document, terms: &[String]) -> f32 {
    let tokens = tokenize(&doc.searchable_text());
    terms
        .iter()
        .map(|term| tokens.iter().filter(|t| *t == term).count())
        .sum::<usize>() as f32
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, doc: &Document) -> Result<()> {
        let mut guard = self.write()?;
        let collection = doc.collection();
        let arena = guard.arena_mut(collection);

        match arena.index.get(doc.id()).copied() {
            Some(_) if collection.is_insert_only() => {
                Err(KnowledgeError::DuplicateId(doc.id().to_string()))
            },
            Some(slot) => {
                let mut replacement = doc.clone();
                if let Some(existing) = arena.slots[slot].as_ref() {
                    replacement.created_at = existing.created_at;
                }
                arena.replace(slot, replacement);
                Ok(())
            },
            None => {
                arena.insert(doc.clone());
                Ok(())
            },
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        let guard = self.read()?;
        Ok(Collection::ALL
            .into_iter()
            .find_map(|c| guard.arena(c).get(id).cloned()))
    }

    async fn scan(&self, filter: &DocFilter) -> Result<Vec<Document>> {
        let guard = self.read()?;
        Ok(filter
            .collections()
            .into_iter()
            .flat_map(|c| guard.arena(c).live())
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn full_text_search(
        &self,
        query: &str,
        filter: &DocFilter,
        limit: usize,
    ) -> Result<Vec<(Document, f32)>> {
        let terms = query_terms(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let guard = self.read()?;
        let mut hits: Vec<(Document, f32)> = filter
            .collections()
            .into_iter()
            .flat_map(|c| guard.arena(c).live())
            .filter(|d| filter.matches(d))
            .filter_map(|d| {
                let score = keyword_score(d, &terms);
                (score > 0.0).then(|| (d.clone(), score))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.0.updated_at.cmp(&a.0.updated_at))
                .then_with(|| a.0.id().cmp(b.0.id()))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self, filter: &DocFilter) -> Result<usize> {
        let guard = self.read()?;
        Ok(filter
            .collections()
            .into_iter()
            .flat_map(|c| guard.arena(c).live())
            .filter(|d| filter.matches(d))
            .count())
    }

    async fn distinct_categories(&self) -> Result<Vec<String>> {
        let guard = self.read()?;
        let categories: BTreeSet<String> = Collection::ALL
            .into_iter()
            .flat_map(|c| guard.arena(c).live())
            .map(|d| d.category.clone())
            .collect();
        Ok(categories.into_iter().collect())
    }

    async fn delete_oldest(&self, collection: Collection, n: usize) -> Result<usize> {
        if n == 0 {
            return Ok(0);
        }
        let mut guard = self.write()?;
        Ok(guard.arena_mut(collection).remove_oldest(n))
    }

    async fn ping(&self) -> Result<()> {
        self.read().map(|_| ())
    }
}
