use crate::partition::BoundedTask;
use bloom_core::{day, tokenizer::NGramTokenizer, ChunkRef, Fingerprint, OutputSink, Request};
use chrono::{DateTime, NaiveDate, Utc};
use std::{cmp::Reverse, collections::BinaryHeap, sync::Arc};

/// Merges the refs of several tasks into one request stream ordered by fingerprint.
///
/// Ties are broken by task position, then by ref position within the task, so each task's own
/// ref order is preserved. Only chunks overlapping `day` are forwarded.
pub struct TaskMergeIterator<'a> {
    tasks: &'a [BoundedTask],
    day_start: DateTime<Utc>,
    day_end: DateTime<Utc>,
    // Per task, the tokens of each of its filters.
    searches: Vec<Vec<Vec<String>>>,
    heap: BinaryHeap<Reverse<(Fingerprint, usize, usize)>>,
}

impl<'a> TaskMergeIterator<'a> {
    pub fn new(day: NaiveDate, tokenizer: NGramTokenizer, tasks: &'a [BoundedTask]) -> Self {
        let mut heap = BinaryHeap::with_capacity(tasks.len());
        for (idx, task) in tasks.iter().enumerate() {
            if let Some(first) = task.refs().first() {
                heap.push(Reverse((first.fingerprint, idx, 0)));
            }
        }

        let searches = tasks
            .iter()
            .map(|t| {
                t.task
                    .request
                    .filters
                    .iter()
                    .map(|f| tokenizer.tokens(f))
                    .collect()
            })
            .collect();

        let (day_start, day_end) = day::day_interval(day);
        Self {
            tasks,
            day_start,
            day_end,
            searches,
            heap,
        }
    }
}

impl Iterator for TaskMergeIterator<'_> {
    type Item = Request;

    fn next(&mut self) -> Option<Request> {
        let Reverse((fp, idx, pos)) = self.heap.pop()?;
        let bounded = &self.tasks[idx];
        let refs = bounded.refs();
        if let Some(next) = refs.get(pos + 1) {
            self.heap.push(Reverse((next.fingerprint, idx, pos + 1)));
        }

        let chunks: Vec<ChunkRef> = refs[pos]
            .refs
            .iter()
            .filter(|c| c.overlaps(self.day_start, self.day_end))
            .copied()
            .collect();

        let response: Arc<dyn OutputSink> = bounded.task.clone();
        Some(Request {
            fp,
            chunks,
            searches: self.searches[idx].clone(),
            response,
        })
    }
}
