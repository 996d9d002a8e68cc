use std::{collections::BTreeMap, hash::Hash};

use hashbrown::HashMap;
use tokio::time::Instant;

/// Blocks we asked a peer for, grouped by piece, each with the instant it
/// times out.
#[derive(Debug)]
pub struct RequestManager<T> {
    requests: BTreeMap<usize, Vec<T>>,
    timeouts: HashMap<T, Instant>,
}

impl<T> Default for RequestManager<T> {
    fn default() -> Self {
        Self { requests: BTreeMap::new(), timeouts: HashMap::new() }
    }
}

impl<T> RequestManager<T>
where
    T: Eq + Clone + Ord + Hash,
    for<'a> &'a T: Into<usize>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the request already existed.
    pub fn add_request(&mut self, block: T, timeout: Instant) -> bool {
        if self.timeouts.contains_key(&block) {
            return false;
        }
        let i: usize = (&block).into();
        self.requests.entry(i).or_default().push(block.clone());
        self.timeouts.insert(block, timeout);
        true
    }

    /// False if there was no such request.
    pub fn remove_request(&mut self, block: &T) -> bool {
        if self.timeouts.remove(block).is_none() {
            return false;
        }
        let i: usize = block.into();

        if let Some(blocks) = self.requests.get_mut(&i) {
            blocks.retain(|b| b != block);
            if blocks.is_empty() {
                self.requests.remove(&i);
            }
        }

        true
    }

    /// Remove all requests, ordered by piece.
    pub fn drain(&mut self) -> Vec<T> {
        self.timeouts.clear();
        std::mem::take(&mut self.requests).into_values().flatten().collect()
    }

    /// Requests whose deadline is not after `now`, ordered.
    pub fn get_timeout_blocks(&self, now: Instant) -> Vec<T> {
        let mut blocks: Vec<T> = self
            .timeouts
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(block, _)| block.clone())
            .collect();
        blocks.sort();
        blocks
    }

    pub fn len(&self) -> usize {
        self.timeouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }
}
