//! Grouping of dequeued tasks by day and by block fingerprint range.

use crate::task::Task;
use bloom_core::{day, BlockRef, GroupedChunkRefs};
use chrono::NaiveDate;
use std::{collections::BTreeMap, ops::Range, sync::Arc};

/// Blocks are per tenant and per day, so tasks are bucketed by both.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey {
    pub day: NaiveDate,
    pub tenant: String,
}

/// Bucket tasks by every day they span.
///
/// A task covering `[from_day, through_day)` is replicated into each of those days, including the
/// day its `through` falls on.
pub fn partition_tasks_by_day<I>(tasks: I) -> BTreeMap<DayKey, Vec<Arc<Task>>>
where
    I: IntoIterator<Item = Arc<Task>>,
{
    let mut by_day: BTreeMap<DayKey, Vec<Arc<Task>>> = BTreeMap::new();
    for task in tasks {
        let (from_day, through_day) = task.bounds();
        for day in day::days_in_range(from_day, through_day) {
            by_day
                .entry(DayKey {
                    day,
                    tenant: task.tenant.clone(),
                })
                .or_default()
                .push(task.clone());
        }
    }
    by_day
}

/// A task restricted to a contiguous run of its (fingerprint-ordered) refs.
#[derive(Debug, Clone)]
pub struct BoundedTask {
    pub task: Arc<Task>,
    range: Range<usize>,
}

impl BoundedTask {
    pub fn refs(&self) -> &[GroupedChunkRefs] {
        &self.task.request.refs[self.range.clone()]
    }
}

/// The tasks that must be queried against one block.
#[derive(Debug, Clone)]
pub struct BoundedTasks {
    pub block_ref: BlockRef,
    pub tasks: Vec<BoundedTask>,
}

/// Assign each task the refs falling into each block's fingerprint range.
///
/// Blocks no task overlaps are dropped.
pub fn partition_fingerprint_range(tasks: &[Arc<Task>], blocks: &[BlockRef]) -> Vec<BoundedTasks> {
    let mut result = Vec::new();
    for block in blocks {
        let mut bounded = BoundedTasks {
            block_ref: block.clone(),
            tasks: Vec::new(),
        };

        for task in tasks {
            let refs = &task.request.refs;
            let start = refs.partition_point(|r| r.fingerprint < block.bounds.min);
            let end = refs.partition_point(|r| r.fingerprint <= block.bounds.max);
            if start >= end {
                continue;
            }
            bounded.tasks.push(BoundedTask {
                task: task.clone(),
                range: start..end,
            });
        }

        if !bounded.tasks.is_empty() {
            result.push(bounded);
        }
    }
    result
}

/// Refs of each task that no block covers, in task order.
pub fn uncovered_refs<'a>(
    tasks: &'a [Arc<Task>],
    blocks: &[BlockRef],
) -> Vec<(&'a Arc<Task>, Vec<&'a GroupedChunkRefs>)> {
    tasks
        .iter()
        .filter_map(|task| {
            let refs: Vec<_> = task
                .request
                .refs
                .iter()
                .filter(|r| !blocks.iter().any(|b| b.bounds.contains(r.fingerprint)))
                .collect();
            (!refs.is_empty()).then_some((task, refs))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FilterRequest;
    use bloom_core::{Fingerprint, FingerprintBounds};
    use chrono::{TimeZone, Utc};

    fn task(fps: &[u64], from_day: u32, through_day: u32) -> Arc<Task> {
        let (task, _handle) = Task::new(
            "tenant",
            FilterRequest {
                from: Utc.with_ymd_and_hms(2024, 1, from_day, 6, 0, 0).unwrap(),
                through: Utc.with_ymd_and_hms(2024, 1, through_day, 6, 0, 0).unwrap(),
                refs: fps
                    .iter()
                    .map(|fp| GroupedChunkRefs {
                        fingerprint: Fingerprint(*fp),
                        refs: Vec::new(),
                    })
                    .collect(),
                filters: Vec::new(),
            },
        );
        task
    }

    fn block(min: u64, max: u64) -> BlockRef {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        BlockRef {
            tenant: "tenant".to_string(),
            start,
            end: start + chrono::Duration::days(1),
            bounds: FingerprintBounds::new(min, max),
            checksum: 0,
        }
    }

    fn fps(bounded: &BoundedTask) -> Vec<u64> {
        bounded.refs().iter().map(|r| r.fingerprint.0).collect()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn single_day_task_lands_in_one_bucket() {
        let by_day = partition_tasks_by_day(vec![task(&[1], 2, 2)]);
        let days: Vec<NaiveDate> = by_day.keys().map(|k| k.day).collect();
        assert_eq!(days, vec![date(2)]);
    }

    #[test]
    fn multi_day_task_is_replicated() {
        let t = task(&[1], 1, 3);
        let other = task(&[2], 2, 2);
        let by_day = partition_tasks_by_day(vec![t.clone(), other.clone()]);

        let days: Vec<NaiveDate> = by_day.keys().map(|k| k.day).collect();
        assert_eq!(days, vec![date(1), date(2), date(3)]);
        let day3 = &by_day[&DayKey {
            day: date(3),
            tenant: "tenant".to_string(),
        }];
        assert_eq!(day3.len(), 1);
        assert_eq!(day3[0].id, t.id);
        let day2 = &by_day[&DayKey {
            day: date(2),
            tenant: "tenant".to_string(),
        }];
        assert!(day2.iter().any(|x| x.id == t.id));
        assert!(day2.iter().any(|x| x.id == other.id));
    }

    #[test]
    fn tasks_are_split_across_block_ranges() {
        let t = task(&[5, 10, 15, 25, 40], 1, 1);
        let blocks = vec![block(0, 12), block(13, 30), block(100, 200)];
        let parts = partition_fingerprint_range(&[t], &blocks);

        assert_eq!(parts.len(), 2, "block without overlapping refs is dropped");
        assert_eq!(parts[0].block_ref.bounds, FingerprintBounds::new(0, 12));
        assert_eq!(fps(&parts[0].tasks[0]), vec![5, 10]);
        assert_eq!(parts[1].block_ref.bounds, FingerprintBounds::new(13, 30));
        assert_eq!(fps(&parts[1].tasks[0]), vec![15, 25]);
    }

    #[test]
    fn ref_appears_in_every_covering_block() {
        let t = task(&[10, 20], 1, 1);
        let blocks = vec![block(0, 15), block(10, 20)];
        let parts = partition_fingerprint_range(&[t], &blocks);

        assert_eq!(fps(&parts[0].tasks[0]), vec![10]);
        assert_eq!(fps(&parts[1].tasks[0]), vec![10, 20]);
    }

    #[test]
    fn partition_membership_matches_bounds() {
        let tasks = vec![task(&[1, 7, 8, 30, 31], 1, 1), task(&[0, 8, 9, 64], 1, 1)];
        let blocks = vec![block(0, 7), block(8, 30), block(32, 63)];
        let parts = partition_fingerprint_range(&tasks, &blocks);

        for part in &parts {
            for bounded in &part.tasks {
                for r in bounded.refs() {
                    assert!(part.block_ref.bounds.contains(r.fingerprint));
                }
                let expected: Vec<u64> = bounded
                    .task
                    .request
                    .refs
                    .iter()
                    .filter(|r| part.block_ref.bounds.contains(r.fingerprint))
                    .map(|r| r.fingerprint.0)
                    .collect();
                assert_eq!(fps(bounded), expected);
            }
        }

        let uncovered = uncovered_refs(&tasks, &blocks);
        let missing: Vec<Vec<u64>> = uncovered
            .iter()
            .map(|(_, refs)| refs.iter().map(|r| r.fingerprint.0).collect())
            .collect();
        assert_eq!(missing, vec![vec![31], vec![64]]);
    }
}
