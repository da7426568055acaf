//! Splits a lazy sequence into bounded chunks without walking it ahead of time.

use crate::error::{PipelineError, Result};

/// Hands out consecutive chunks of at most `size` items from an underlying iterator.
///
/// Each [`Chunk`] mutably borrows the chunker, so the next chunk can only be requested
/// once the previous one is gone. A chunk dropped before it is exhausted drains its
/// remaining items, keeping chunk boundaries fixed regardless of how far the caller read.
pub struct Chunker<I: Iterator> {
    source: I,
    size: usize,
    next_index: usize,
}

impl<I: Iterator> Chunker<I> {
    /// Wraps `source`; `size` must be at least one.
    pub fn new(source: I, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PipelineError::config("chunk size must be at least 1"));
        }
        Ok(Self {
            source,
            size,
            next_index: 0,
        })
    }

    /// Starts the next chunk, or returns `None` once the source is exhausted.
    ///
    /// Pulls exactly one item from the source to decide whether a chunk exists.
    pub fn next_chunk(&mut self) -> Option<Chunk<'_, I>> {
        let first = self.source.next()?;
        let index = self.next_index;
        self.next_index += 1;
        Some(Chunk {
            source: &mut self.source,
            first: Some(first),
            remaining: self.size - 1,
            index,
        })
    }
}

/// One bounded slice of the source sequence.
pub struct Chunk<'a, I: Iterator> {
    source: &'a mut I,
    first: Option<I::Item>,
    remaining: usize,
    index: usize,
}

impl<I: Iterator> Chunk<'_, I> {
    /// Zero-based position of this chunk in the run.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<I: Iterator> Iterator for Chunk<'_, I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }
        if self.remaining == 0 {
            return None;
        }
        match self.source.next() {
            Some(item) => {
                self.remaining -= 1;
                Some(item)
            }
            None => {
                self.remaining = 0;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let pending = usize::from(self.first.is_some());
        (pending, Some(pending + self.remaining))
    }
}

impl<I: Iterator> Drop for Chunk<'_, I> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}
