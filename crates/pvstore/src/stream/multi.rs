//! Chains per-file streams across partitions.

use super::{EventIter, FileBackedEventStream};
use crate::codec::Sample;
use crate::error::Result;
use std::collections::VecDeque;
use std::path::PathBuf;

/// Streams several partition files one after another.
///
/// Files are opened lazily; the previous file is dropped before the next is opened. Optional leading
/// samples (the anchor from an earlier partition) are yielded first.
pub struct MultiFileEventStream {
    leading: VecDeque<Sample>,
    pending: VecDeque<FileBackedEventStream>,
    current: Option<EventIter>,
}

impl MultiFileEventStream {
    /// Chains `streams` in the given order.
    pub fn new(streams: impl IntoIterator<Item = FileBackedEventStream>) -> Self {
        Self {
            leading: VecDeque::new(),
            pending: streams.into_iter().collect(),
            current: None,
        }
    }

    /// A stream that yields nothing.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Yields `sample` before anything read from the files.
    pub fn with_leading_sample(mut self, sample: Sample) -> Self {
        self.leading.push_back(sample);
        self
    }

    /// Files not yet opened.
    pub fn remaining_paths(&self) -> Vec<PathBuf> {
        self.pending
            .iter()
            .map(|stream| stream.path().to_path_buf())
            .collect()
    }
}

impl Iterator for MultiFileEventStream {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(sample) = self.leading.pop_front() {
            return Some(Ok(sample));
        }
        loop {
            if let Some(iter) = self.current.as_mut() {
                match iter.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }
            let mut stream = self.pending.pop_front()?;
            match stream.open() {
                Ok(iter) => self.current = Some(iter),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
