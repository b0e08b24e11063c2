//! Document enumeration: filtered, paginated, restartable.
//!
//! Pages walk the state partitions in manifest order and ids in ULID order within
//! each partition (creation order, to the millisecond). A cursor is just "where the
//! last page stopped", so any enumeration can be resumed from a saved cursor.
//! Documents that move while an enumeration is in flight may be seen twice or not at
//! all; there is no cross-move ordering guarantee.

use crate::core::error::BurrowError;
use crate::core::store::Store;
use crate::plugins::documents::{self, Document};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::iter::FusedIterator;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub state: Option<String>,
    pub owner: Option<String>,
    pub tag: Option<String>,
    /// Case-insensitive substring of title or description.
    pub text: Option<String>,
    pub page_size: Option<usize>,
}

impl DocumentFilter {
    pub fn in_state(mut self, state: &str) -> Self {
        self.state = Some(state.to_string());
        self
    }

    pub fn owned_by(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn tagged(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn matching(mut self, text: &str) -> Self {
        self.text = Some(text.to_lowercase());
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(owner) = &self.owner {
            if !doc.is_owned_by(owner) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !doc.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            if !doc.title.to_lowercase().contains(&needle)
                && !doc.description.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

/// Resume point: the partition index (manifest order) and the last id returned from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub state_index: usize,
    pub after_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub documents: Vec<Document>,
    /// `None` once every partition has been walked.
    pub next: Option<Cursor>,
}

pub fn page(store: &Store, filter: &DocumentFilter, cursor: Option<&Cursor>) -> Result<Page, BurrowError> {
    let size = match filter.page_size {
        Some(n) if n > 0 => n,
        _ => store.options().page_size.max(1),
    };
    let only = match &filter.state {
        Some(state) => {
            store.require_state(state)?;
            store.manifest().state_index(state)
        }
        None => None,
    };

    let start = cursor.map(|c| c.state_index).unwrap_or(0);
    let mut documents = Vec::with_capacity(size);

    for (index, state) in store.manifest().states.iter().enumerate().skip(start) {
        if only.is_some_and(|i| i != index) {
            continue;
        }
        let after = cursor
            .filter(|c| c.state_index == index)
            .and_then(|c| c.after_id.as_deref());

        for id in documents::list_ids(store, &state.id)? {
            if after.is_some_and(|a| id.as_str() <= a) {
                continue;
            }
            let doc = match documents::read_at(&store.document_path(&state.id, &id)) {
                Ok(doc) => doc,
                // Moved out between listing and reading.
                Err(BurrowError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if !filter.matches(&doc) {
                continue;
            }
            documents.push(doc);
            if documents.len() == size {
                return Ok(Page {
                    documents,
                    next: Some(Cursor {
                        state_index: index,
                        after_id: Some(id),
                    }),
                });
            }
        }
    }

    Ok(Page {
        documents,
        next: None,
    })
}

/// Lazily paged iterator over matching documents. Stops after the first error.
pub struct Documents<'a> {
    store: &'a Store,
    filter: DocumentFilter,
    cursor: Option<Cursor>,
    buffer: VecDeque<Document>,
    done: bool,
}

impl Documents<'_> {
    /// Cursor of the last page fetched; pass to [`enumerate_from`] to restart there.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }
}

impl Iterator for Documents<'_> {
    type Item = Result<Document, BurrowError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Some(Ok(doc));
            }
            if self.done {
                return None;
            }
            match page(self.store, &self.filter, self.cursor.as_ref()) {
                Ok(page) => {
                    self.buffer.extend(page.documents);
                    match page.next {
                        Some(next) => self.cursor = Some(next),
                        None => self.done = true,
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl FusedIterator for Documents<'_> {}

pub fn enumerate<'a>(store: &'a Store, filter: DocumentFilter) -> Documents<'a> {
    enumerate_from(store, filter, None)
}

pub fn enumerate_from<'a>(store: &'a Store, filter: DocumentFilter, cursor: Option<Cursor>) -> Documents<'a> {
    Documents {
        store,
        filter,
        cursor,
        buffer: VecDeque::new(),
        done: false,
    }
}
