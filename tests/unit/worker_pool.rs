//! Unit tests for the worker pool and batch execution

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use ghnotify::cancel::{CancelReason, CancelToken};
use ghnotify::pool::{execute_batch, PoolError, Task, WorkerPool};

fn task<F>(f: F) -> Task<usize, String>
where
    F: std::future::Future<Output = Result<usize, String>> + Send + 'static,
{
    Box::new(move || Box::pin(f) as BoxFuture<'static, Result<usize, String>>)
}

#[tokio::test]
async fn test_every_task_gets_a_unique_index() {
    let tasks: Vec<_> = (0..100)
        .map(|i| {
            task(async move {
                tokio::time::sleep(Duration::from_millis((i % 7) as u64)).await;
                Ok(i)
            })
        })
        .collect();

    let results = execute_batch(tasks, 4, &CancelToken::new()).await.unwrap();

    assert_eq!(results.len(), 100);
    let indices: HashSet<usize> = results.iter().map(|r| r.index).collect();
    assert_eq!(indices, (0..100).collect());
    // Results come back in index order and the index matches submission order.
    for (expected, result) in results.iter().enumerate() {
        assert_eq!(result.index, expected);
        assert_eq!(result.outcome.as_ref().unwrap(), &expected);
    }
}

#[tokio::test]
async fn test_concurrency_never_exceeds_worker_count() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let running = running.clone();
            let peak = peak.clone();
            task(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            })
        })
        .collect();

    execute_batch(tasks, 3, &CancelToken::new()).await.unwrap();
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_task_errors_are_isolated() {
    let tasks: Vec<_> = (0..10)
        .map(|i| {
            task(async move {
                if i % 3 == 0 {
                    Err(format!("task {i} failed"))
                } else {
                    Ok(i)
                }
            })
        })
        .collect();

    let results = execute_batch(tasks, 2, &CancelToken::new()).await.unwrap();

    assert_eq!(results.len(), 10);
    let failed: Vec<usize> = results.iter().filter(|r| r.is_err()).map(|r| r.index).collect();
    assert_eq!(failed, vec![0, 3, 6, 9]);
}

#[tokio::test]
async fn test_cancellation_returns_partial_results() {
    let cancel = CancelToken::new();
    let tasks: Vec<_> = (0..50)
        .map(|i| {
            task(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(i)
            })
        })
        .collect();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(70)).await;
        trigger.cancel();
    });

    let interrupted = execute_batch(tasks, 2, &cancel).await.unwrap_err();

    assert_eq!(interrupted.error, PoolError::Cancelled(CancelReason::Cancelled));
    assert!(!interrupted.partial.is_empty());
    assert!(interrupted.partial.len() < 50);
    assert!(interrupted.partial.windows(2).all(|w| w[0].index < w[1].index));
}

#[tokio::test]
async fn test_empty_batch_completes() {
    let results = execute_batch(Vec::<Task<usize, String>>::new(), 4, &CancelToken::new())
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_blocked_submit_observes_cancellation() {
    let cancel = CancelToken::new();
    let mut pool: WorkerPool<(), ()> = WorkerPool::with_queue_size(1, 1, cancel.clone());
    let _results = pool.take_results();

    pool.submit(|| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.submit(|| async { Ok(()) }).await.unwrap();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), pool.submit(|| async { Ok(()) }))
        .await
        .expect("submit stayed blocked after cancellation");
    assert_eq!(result, Err(PoolError::Cancelled(CancelReason::Cancelled)));
    assert_eq!(pool.submitted(), 2);

    tokio::time::timeout(Duration::from_secs(2), pool.wait())
        .await
        .expect("workers did not exit after cancellation");
}
