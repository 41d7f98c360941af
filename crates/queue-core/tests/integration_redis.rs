//! End-to-end scenarios against a live Redis instance.
//!
//! Ignored by default — these need `REDIS_URL` pointing at a scratch
//! database and will flush it. Run with:
//!
//! ```text
//! REDIS_URL=redis://localhost:6379/15 cargo test -p queue-core --test integration_redis -- --ignored
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use queue_core::{JobOpts, Queue, QueueConfig};
use queue_redis::RedisJobStore;
use serde_json::json;

async fn fresh_queue(name: &str) -> Queue {
    let url = env::var("REDIS_URL").expect("REDIS_URL must be set for integration tests");
    let config = QueueConfig::from_url(url);
    let store = Arc::new(
        RedisJobStore::connect(&config, name)
            .await
            .expect("connect to redis"),
    );
    store.empty().await.expect("start from a clean slate");
    Queue::connect(config, store).await.expect("queue connects")
}

#[tokio::test]
#[ignore]
async fn a_job_added_is_eventually_completed() {
    let queue = fresh_queue("integration-basic").await;
    let mut events = queue.subscribe();

    let id = queue
        .add(json!({"to": "alice@example.com"}), JobOpts::default())
        .await
        .expect("job added");

    queue
        .process(2, move |job| async move {
            assert_eq!(job.data["to"], "alice@example.com");
            Ok(json!({"sent": true}))
        })
        .await
        .expect("handler installed");

    let mut saw_completed = false;
    for _ in 0..20 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(event)) if event.job_id == id && event.kind.as_str() == "completed" => {
                saw_completed = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }

    assert!(saw_completed, "expected a completed event for {id}");
    queue.close(false).await.expect("clean shutdown");
}

#[tokio::test]
#[ignore]
async fn delayed_jobs_are_promoted_once_their_delay_elapses() {
    let queue = fresh_queue("integration-delayed").await;

    let opts = JobOpts {
        delay: 200,
        ..Default::default()
    };
    queue.add(json!({"n": 1}), opts).await.expect("job added");

    let counts_before = queue.job_counts().await.expect("counts");
    assert_eq!(counts_before.delayed, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;

    let counts_after = queue.job_counts().await.expect("counts");
    assert_eq!(counts_after.delayed, 0);
    assert_eq!(counts_after.waiting, 1);

    queue.close(false).await.expect("clean shutdown");
}

#[tokio::test]
#[ignore]
async fn pausing_stops_new_jobs_from_being_claimed() {
    let queue = fresh_queue("integration-pause").await;
    queue.pause().await.expect("pause");

    queue
        .add(json!({"n": 1}), JobOpts::default())
        .await
        .expect("job added while paused");

    let counts = queue.job_counts().await.expect("counts");
    assert_eq!(counts.paused, 1);
    assert_eq!(counts.waiting, 0);

    queue.resume().await.expect("resume");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let counts = queue.job_counts().await.expect("counts");
    assert_eq!(counts.paused, 0);
    assert_eq!(counts.waiting, 1);

    queue.close(false).await.expect("clean shutdown");
}

#[tokio::test]
#[ignore]
async fn a_failing_handler_retries_up_to_the_configured_attempts() {
    let queue = fresh_queue("integration-retry").await;

    let opts = JobOpts {
        attempts: 3,
        backoff: Some(queue_core::job::Backoff::Fixed { delay_ms: 50 }),
        ..Default::default()
    };
    let id = queue
        .add(json!({"n": 1}), opts)
        .await
        .expect("job added");

    let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let attempts_for_handler = Arc::clone(&attempts);
    queue
        .process(1, move |_job| {
            let attempts = Arc::clone(&attempts_for_handler);
            async move {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                anyhow::bail!("transient failure")
            }
        })
        .await
        .expect("handler installed");

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(attempts.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    let job = queue.get_job(&id).await.expect("lookup");
    assert!(job.is_none() || job.unwrap().attempts_made >= 3);

    queue.close(false).await.expect("clean shutdown");
}
