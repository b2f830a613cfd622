//! Keyset iteration.

use super::traits::PageSource;
use crate::Result;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
enum IterState {
    Start,
    Paging(String),
    Done,
}

/// Paginated scan over one namespace, ordered by key.
///
/// Each page is fetched as `key > cursor`, so deleting rows that were
/// already yielded never causes later rows to be skipped. A page shorter
/// than the limit ends the scan without another round trip.
pub struct KeysetIterator<'a> {
    source: &'a dyn PageSource,
    limit: usize,
    state: IterState,
    buffer: VecDeque<(String, String)>,
}

impl<'a> KeysetIterator<'a> {
    /// Creates an iterator in its initial state.
    #[must_use]
    pub fn new(source: &'a dyn PageSource, limit: usize) -> Self {
        Self {
            source,
            limit: limit.max(1),
            state: IterState::Start,
            buffer: VecDeque::new(),
        }
    }

    /// Returns the next `(prefixed key, value)` pair.
    ///
    /// After an error the iterator is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if fetching a page fails.
    pub async fn next(&mut self) -> Result<Option<(String, String)>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Ok(Some(entry));
            }

            let cursor = match &self.state {
                IterState::Done => return Ok(None),
                IterState::Start => None,
                IterState::Paging(cursor) => Some(cursor.clone()),
            };

            let page = match self.source.fetch_page(cursor.as_deref(), self.limit).await {
                Ok(page) => page,
                Err(e) => {
                    self.state = IterState::Done;
                    return Err(e);
                },
            };

            if page.fetched == 0 {
                self.state = IterState::Done;
                return Ok(None);
            }

            self.state = match page.last_key {
                Some(last) if page.fetched >= self.limit => IterState::Paging(last),
                _ => IterState::Done,
            };
            self.buffer.extend(page.entries);
        }
    }

    /// Drains the iterator into a vector.
    ///
    /// # Errors
    ///
    /// Returns the first page error.
    pub async fn collect_all(mut self) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for KeysetIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysetIterator")
            .field("limit", &self.limit)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
