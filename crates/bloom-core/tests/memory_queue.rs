use bloom_core::lite::MemoryQueue;
use bloom_core::{ErrorKind, QueueIndex, QueueItem, RequestQueue};
use std::{sync::Arc, time::Duration};

fn item(n: u32) -> QueueItem {
    Arc::new(n)
}

fn values(items: &[QueueItem]) -> Vec<u32> {
    items
        .iter()
        .filter_map(|i| i.downcast_ref::<u32>().copied())
        .collect()
}

#[tokio::test]
async fn dequeue_many_respects_max_items_and_fifo_order() -> anyhow::Result<()> {
    let queue = MemoryQueue::new();
    queue.register_consumer_connection("worker-0");
    for n in 0..5 {
        queue.enqueue("tenant", item(n)).await?;
    }

    let batch = queue
        .dequeue_many(QueueIndex::START, "worker-0", 3, Duration::from_millis(10))
        .await;
    anyhow::ensure!(batch.error.is_none(), "unexpected error: {:?}", batch.error);
    anyhow::ensure!(values(&batch.items) == vec![0, 1, 2]);
    queue.release_requests(batch.items);

    let batch = queue
        .dequeue_many(batch.next_index, "worker-0", 3, Duration::from_millis(10))
        .await;
    anyhow::ensure!(values(&batch.items) == vec![3, 4]);
    queue.release_requests(batch.items);

    let stats = queue.stats();
    anyhow::ensure!(stats.batches_acquired == 2 && stats.batches_released == 2);
    Ok(())
}

#[tokio::test]
async fn dequeue_returns_empty_batch_after_max_wait() -> anyhow::Result<()> {
    let queue = MemoryQueue::new();
    queue.register_consumer_connection("worker-0");

    let started = tokio::time::Instant::now();
    let batch = queue
        .dequeue_many(QueueIndex::START, "worker-0", 10, Duration::from_millis(50))
        .await;
    anyhow::ensure!(started.elapsed() >= Duration::from_millis(50));
    anyhow::ensure!(batch.items.is_empty() && batch.error.is_none());
    queue.release_requests(batch.items);
    anyhow::ensure!(queue.stats().batches_released == 1);
    Ok(())
}

#[tokio::test]
async fn waiting_consumer_wakes_on_enqueue() -> anyhow::Result<()> {
    let queue = Arc::new(MemoryQueue::new());
    queue.register_consumer_connection("worker-0");

    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .dequeue_many(QueueIndex::START, "worker-0", 10, Duration::from_secs(5))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.enqueue("tenant", item(7)).await?;

    let batch = tokio::time::timeout(Duration::from_secs(1), consumer).await??;
    anyhow::ensure!(values(&batch.items) == vec![7]);
    queue.release_requests(batch.items);
    Ok(())
}

#[tokio::test]
async fn stopped_queue_drains_then_reports_stopped() -> anyhow::Result<()> {
    let queue = MemoryQueue::new();
    queue.register_consumer_connection("worker-0");
    queue.enqueue("tenant", item(1)).await?;
    queue.stop();

    let err = queue
        .enqueue("tenant", item(2))
        .await
        .expect_err("enqueue after stop must fail");
    anyhow::ensure!(err.kind() == ErrorKind::Stopped);

    let batch = queue
        .dequeue_many(QueueIndex::START, "worker-0", 10, Duration::from_millis(10))
        .await;
    anyhow::ensure!(values(&batch.items) == vec![1] && batch.error.is_none());
    queue.release_requests(batch.items);

    let batch = queue
        .dequeue_many(QueueIndex::START, "worker-0", 10, Duration::from_millis(10))
        .await;
    anyhow::ensure!(batch.items.is_empty());
    anyhow::ensure!(batch.error.as_ref().is_some_and(|e| e.is_stopped()));
    queue.release_requests(batch.items);
    Ok(())
}

#[tokio::test]
async fn unregistered_consumer_gets_soft_error() -> anyhow::Result<()> {
    let queue = MemoryQueue::new();
    queue.register_consumer_connection("worker-0");
    queue.unregister_consumer_connection("worker-0");
    anyhow::ensure!(queue.consumers().is_empty());

    let batch = queue
        .dequeue_many(QueueIndex::START, "worker-0", 10, Duration::from_millis(10))
        .await;
    anyhow::ensure!(batch.items.is_empty());
    anyhow::ensure!(batch
        .error
        .as_ref()
        .is_some_and(|e| e.kind() == ErrorKind::Other));
    queue.release_requests(batch.items);
    Ok(())
}
