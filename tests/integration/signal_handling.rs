use std::time::Duration;

use ghnotify::cancel::{CancelReason, CancelToken};

#[tokio::test]
async fn cancel_notifies_waiters() {
    let token = CancelToken::new();
    let waiter = {
        let handle = token.clone();
        tokio::spawn(async move { handle.cancelled().await })
    };

    // Give the task time to start waiting
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert_eq!(result.unwrap().unwrap(), CancelReason::Cancelled);
}

/// Cancelling before anyone waits must not lose the wake-up.
#[tokio::test]
async fn cancel_before_wait_no_deadlock() {
    let token = CancelToken::new();
    token.cancel();

    let handle = token.clone();
    let waiter = tokio::spawn(async move { handle.cancelled().await });

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok(), "cancelled() hung although the token already fired");
}

#[tokio::test]
async fn concurrent_waiters_all_notified() {
    let token = CancelToken::new();
    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let handle = token.clone();
            tokio::spawn(async move { handle.cancelled().await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    for waiter in waiters {
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter missed cancellation")
            .unwrap();
        assert_eq!(reason, CancelReason::Cancelled);
    }
}

#[tokio::test]
async fn deadline_fires_without_cancel() {
    let token = CancelToken::with_timeout(Duration::from_millis(30));
    assert!(!token.is_cancelled());

    let reason = tokio::time::timeout(Duration::from_secs(1), token.cancelled())
        .await
        .unwrap();
    assert_eq!(reason, CancelReason::DeadlineExceeded);
    assert_eq!(token.reason(), Some(CancelReason::DeadlineExceeded));
}

#[tokio::test]
async fn child_follows_parent_but_not_the_reverse() {
    let parent = CancelToken::new();
    let child = parent.child_with_timeout(None);
    child.cancel();
    assert!(!parent.is_cancelled());

    let parent = CancelToken::new();
    let child = parent.child_with_timeout(Some(Duration::from_secs(60)));
    parent.cancel();
    assert_eq!(child.reason(), Some(CancelReason::Cancelled));
    assert_eq!(child.sleep(Duration::from_secs(60)).await, Err(CancelReason::Cancelled));
}
