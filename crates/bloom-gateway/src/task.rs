use bloom_core::{day, Error, GroupedChunkRefs, Output, OutputSink, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type TaskId = Uuid;

/// Chunks to filter for one tenant, bounded to a time range.
#[derive(Debug, Clone)]
pub struct FilterRequest {
    pub from: DateTime<Utc>,
    pub through: DateTime<Utc>,
    pub refs: Vec<GroupedChunkRefs>,
    /// Line-contains expressions; a chunk must match all of them to be kept.
    pub filters: Vec<String>,
}

/// A unit of work owned by exactly one worker between dequeue and close.
///
/// Outputs are staged on the task while it is processed and only reach the result channel when
/// the task is closed without an error. Once an error has been recorded, staged and later
/// outputs are discarded, so the caller observes either outputs or a single error.
pub struct Task {
    pub id: TaskId,
    pub tenant: String,
    pub request: FilterRequest,
    cancel: CancellationToken,
    delivery: Mutex<Delivery>,
}

struct Delivery {
    outputs: Vec<Output>,
    error: Option<Error>,
    results_tx: Option<mpsc::UnboundedSender<Output>>,
    error_tx: Option<oneshot::Sender<Error>>,
    closed: bool,
}

impl Task {
    /// Create a task and the caller-side handle observing it.
    ///
    /// Refs are put into non-decreasing fingerprint order; refs of equal fingerprint keep their
    /// relative order.
    pub fn new(tenant: impl Into<String>, mut request: FilterRequest) -> (Arc<Self>, TaskHandle) {
        request.refs.sort_by_key(|r| r.fingerprint);

        let (results_tx, results) = mpsc::unbounded_channel();
        let (error_tx, error) = oneshot::channel();
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();

        let task = Arc::new(Self {
            id,
            tenant: tenant.into(),
            request,
            cancel: cancel.clone(),
            delivery: Mutex::new(Delivery {
                outputs: Vec::new(),
                error: None,
                results_tx: Some(results_tx),
                error_tx: Some(error_tx),
                closed: false,
            }),
        });

        let handle = TaskHandle {
            id,
            results,
            error,
            cancel,
        };
        (task, handle)
    }

    /// Days of the request as `[from_day, through_day)`: `through_day` is the day after the one
    /// `through` falls on, so the last (partial) day is included.
    pub fn bounds(&self) -> (NaiveDate, NaiveDate) {
        (
            day::day_of(self.request.from),
            day::day_after(self.request.through),
        )
    }

    /// The cancellation error, once the caller cancelled the task.
    pub fn err(&self) -> Option<Error> {
        self.cancel.is_cancelled().then(Error::canceled)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn send_output(&self, output: Output) {
        let mut delivery = self.delivery();
        if delivery.closed || delivery.error.is_some() {
            return;
        }
        delivery.outputs.push(output);
    }

    /// Record the terminal error. Only the first error is kept.
    pub fn send_error(&self, err: Error) {
        let mut delivery = self.delivery();
        if delivery.closed || delivery.error.is_some() {
            return;
        }
        delivery.outputs.clear();
        delivery.error = Some(err);
    }

    /// Deliver the outcome and close both channels. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let mut delivery = self.delivery();
        if delivery.closed {
            return false;
        }
        delivery.closed = true;

        let results_tx = delivery.results_tx.take();
        let error_tx = delivery.error_tx.take();
        let outputs = std::mem::take(&mut delivery.outputs);
        match delivery.error.take() {
            Some(err) => {
                if let Some(tx) = error_tx {
                    let _ = tx.send(err);
                }
            }
            None => {
                if let Some(tx) = results_tx.as_ref() {
                    for output in outputs {
                        if tx.send(output).is_err() {
                            break;
                        }
                    }
                }
            }
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.delivery().closed
    }

    fn delivery(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutputSink for Task {
    fn send(&self, output: Output) {
        self.send_output(output);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("from", &self.request.from)
            .field("through", &self.request.through)
            .field("refs", &self.request.refs.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Caller side of a [`Task`].
#[derive(Debug)]
pub struct TaskHandle {
    pub id: TaskId,
    results: mpsc::UnboundedReceiver<Output>,
    error: oneshot::Receiver<Error>,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the task is closed and return its outputs or its error.
    pub async fn wait(mut self) -> Result<Vec<Output>> {
        let mut outputs = Vec::new();
        while let Some(output) = self.results.recv().await {
            outputs.push(output);
        }
        match self.error.await {
            Ok(err) => Err(err),
            Err(_) => Ok(outputs),
        }
    }
}

/// Tasks enqueued but not yet picked up by a worker, so they can be cancelled from outside.
#[derive(Debug, Default)]
pub struct PendingTasks {
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
}

impl PendingTasks {
    pub fn add(&self, task: Arc<Task>) {
        self.lock().insert(task.id, task);
    }

    pub fn remove(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.lock().remove(id)
    }

    /// Cancel a pending task. Returns `false` if the task is unknown or already dequeued.
    pub fn cancel(&self, id: &TaskId) -> bool {
        match self.lock().get(id) {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<Task>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloom_core::{ErrorKind, Fingerprint};
    use chrono::TimeZone;

    fn request(fps: &[u64]) -> FilterRequest {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        FilterRequest {
            from,
            through: from + chrono::Duration::hours(1),
            refs: fps
                .iter()
                .map(|fp| GroupedChunkRefs {
                    fingerprint: Fingerprint(*fp),
                    refs: Vec::new(),
                })
                .collect(),
            filters: vec!["error".to_string()],
        }
    }

    #[tokio::test]
    async fn close_flushes_outputs_once() {
        let (task, handle) = Task::new("tenant", request(&[10, 20]));
        task.send_output(Output::unfiltered(Fingerprint(10)));
        task.send_output(Output::unfiltered(Fingerprint(20)));

        assert!(task.close());
        assert!(!task.close());
        task.send_output(Output::unfiltered(Fingerprint(30)));

        let outputs = handle.wait().await.unwrap();
        assert_eq!(
            outputs,
            vec![
                Output::unfiltered(Fingerprint(10)),
                Output::unfiltered(Fingerprint(20))
            ]
        );
    }

    #[tokio::test]
    async fn error_discards_outputs_and_first_error_wins() {
        let (task, handle) = Task::new("tenant", request(&[10]));
        task.send_output(Output::unfiltered(Fingerprint(10)));
        task.send_error(Error::msg("first"));
        task.send_error(Error::canceled());
        task.send_output(Output::unfiltered(Fingerprint(10)));
        task.close();

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(err.to_string(), "first");
    }

    #[test]
    fn refs_are_sorted_stably_by_fingerprint() {
        let (task, _handle) = Task::new("tenant", request(&[30, 10, 20]));
        let fps: Vec<u64> = task.request.refs.iter().map(|r| r.fingerprint.0).collect();
        assert_eq!(fps, vec![10, 20, 30]);
    }

    #[test]
    fn bounds_include_the_day_through_falls_on() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        let mut req = request(&[10]);
        req.from = from;
        req.through = from + chrono::Duration::days(1);
        let (task, _handle) = Task::new("tenant", req);

        let day = |d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();
        assert_eq!(task.bounds(), (day(1), day(3)));
    }

    #[test]
    fn handle_cancel_is_visible_to_task() {
        let (task, handle) = Task::new("tenant", request(&[10]));
        assert!(task.err().is_none());
        handle.cancel();
        assert!(task.err().is_some_and(|e| e.is_canceled()));
    }

    #[test]
    fn pending_tasks_cancel_and_remove() {
        let pending = PendingTasks::default();
        let (task, _handle) = Task::new("tenant", request(&[10]));
        pending.add(task.clone());

        assert!(pending.cancel(&task.id));
        assert!(task.err().is_some());
        assert!(pending.remove(&task.id).is_some());
        assert!(!pending.cancel(&task.id));
        assert!(pending.is_empty());
    }
}
