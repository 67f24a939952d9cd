//! Consumer loop behaviour against the in-memory broker.

mod common;

use common::{eventually, fast_policy, memory_manager, within, LogCapture};
use jobstats::broker::memory::MemoryBroker;
use jobstats::broker::{Job, JobId};
use jobstats::client::{
    handler_fn, ChannelRegistry, Consumer, ConsumerOptions, FailurePolicy, JobHandler,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_options(failure_policy: FailurePolicy) -> ConsumerOptions {
    ConsumerOptions {
        failure_policy,
        error_backoff: Duration::from_millis(5),
    }
}

async fn registry_for(broker: &MemoryBroker) -> ChannelRegistry {
    let manager = memory_manager(broker, Some(fast_policy(3)));
    manager.connect().await.unwrap();
    ChannelRegistry::new(manager)
}

/// Records every job it sees and fails the ids it was told to.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<JobId>>,
    fail: Vec<JobId>,
}

#[async_trait::async_trait]
impl JobHandler for Recorder {
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        self.seen.lock().push(job.id);
        if self.fail.contains(&job.id) {
            anyhow::bail!("handler rejected job {}", job.id);
        }
        Ok(())
    }
}

#[tokio::test]
async fn failed_job_is_deleted_and_not_redelivered() {
    let broker = MemoryBroker::new();
    broker.put_job(Job::new(7, "jobs", "bad"));
    broker.put_job(Job::new(8, "jobs", "good"));
    let registry = registry_for(&broker).await;
    let channel = registry.create_channel(Some("jobs")).await.unwrap();

    let recorder = Arc::new(Recorder {
        fail: vec![JobId(7)],
        ..Recorder::default()
    });
    let consumer = Consumer::new(channel, recorder.clone()).with_options(fast_options(FailurePolicy::Delete));
    let cancel = consumer.cancellation_token();
    let task = tokio::spawn(consumer.run());

    eventually("both jobs deleted", || broker.deleted().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    let report = within("consumer stop", task).await.unwrap().unwrap();

    assert_eq!(broker.deleted(), vec![JobId(7), JobId(8)]);
    assert_eq!(*recorder.seen.lock(), vec![JobId(7), JobId(8)]);
    assert!(broker.released().is_empty());
    assert_eq!(broker.ready_len("jobs"), 0);
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors, 0);
}

#[tokio::test]
async fn jobs_are_processed_one_at_a_time() {
    let broker = MemoryBroker::new();
    for i in 0..5 {
        broker.put("jobs", format!("job-{i}"));
    }
    let registry = registry_for(&broker).await;
    let channel = registry.create_channel(Some("jobs")).await.unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = {
        let active = active.clone();
        let peak = peak.clone();
        handler_fn(move |_job: Job| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };
    let consumer = Consumer::new(channel, handler);
    let cancel = consumer.cancellation_token();
    let task = tokio::spawn(consumer.run());

    eventually("all jobs deleted", || broker.deleted().len() == 5).await;
    cancel.cancel();
    let report = within("consumer stop", task).await.unwrap().unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(report.processed, 5);
    assert_eq!(broker.reserved_len("jobs"), 0);
}

#[tokio::test]
async fn release_policy_hands_failed_job_back() {
    let broker = MemoryBroker::new();
    let id = broker.put("jobs", "flaky");
    let registry = registry_for(&broker).await;
    let channel = registry.create_channel(Some("jobs")).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let handler = {
        let attempts = attempts.clone();
        handler_fn(move |job: Job| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::ensure!(job.redelivered, "first delivery fails");
                Ok(())
            }
        })
    };
    let consumer = Consumer::new(channel, handler).with_options(fast_options(FailurePolicy::Release));
    let cancel = consumer.cancellation_token();
    let task = tokio::spawn(consumer.run());

    eventually("redelivered job deleted", || broker.deleted() == vec![id]).await;
    cancel.cancel();
    let report = within("consumer stop", task).await.unwrap().unwrap();

    assert_eq!(broker.released(), vec![id]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.processed, 1);
}

#[tokio::test]
async fn cancellation_stops_a_loop_blocked_in_reserve() {
    let broker = MemoryBroker::new();
    let registry = registry_for(&broker).await;
    let channel = registry.create_channel(Some("idle")).await.unwrap();

    let consumer = Consumer::new(channel, Arc::new(Recorder::default()));
    let cancel = consumer.cancellation_token();
    let task = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!task.is_finished());
    cancel.cancel();

    let report = within("consumer stop", task).await.unwrap().unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.errors, 0);
}

#[tokio::test]
async fn reserve_errors_are_logged_and_retried() {
    let broker = MemoryBroker::new();
    broker.fail_reserves(2);
    let id = broker.put("jobs", "eventually");
    let registry = registry_for(&broker).await;
    let channel = registry.create_channel(Some("jobs")).await.unwrap();

    let consumer = Consumer::new(channel, Arc::new(Recorder::default()))
        .with_options(fast_options(FailurePolicy::Delete));
    let cancel = consumer.cancellation_token();
    let task = tokio::spawn(consumer.run());

    eventually("job deleted", || broker.deleted() == vec![id]).await;
    cancel.cancel();
    let report = within("consumer stop", task).await.unwrap().unwrap();

    assert_eq!(report.errors, 2);
    assert_eq!(report.processed, 1);
}

#[tokio::test]
async fn consumer_resumes_after_reconnect() {
    let broker = MemoryBroker::new();
    let registry = registry_for(&broker).await;
    let channel = registry.create_channel(Some("jobs")).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let consumer = Consumer::new(channel, recorder.clone()).with_options(fast_options(FailurePolicy::Delete));
    let cancel = consumer.cancellation_token();
    let task = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(10)).await;
    broker.drop_sessions();
    eventually("reconnect", || broker.handshakes() == 2).await;

    let id = broker.put("jobs", "after the drop");
    eventually("job deleted", || broker.deleted() == vec![id]).await;
    cancel.cancel();
    within("consumer stop", task).await.unwrap().unwrap();

    assert_eq!(*recorder.seen.lock(), vec![id]);
}

#[tokio::test]
async fn consumer_stops_when_connection_fails_for_good() {
    let broker = MemoryBroker::new();
    let registry = registry_for(&broker).await;
    let channel = registry.create_channel(Some("jobs")).await.unwrap();

    let consumer = Consumer::new(channel, Arc::new(Recorder::default()))
        .with_options(fast_options(FailurePolicy::Delete));
    let task = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(10)).await;
    broker.refuse_connects(u32::MAX);
    broker.drop_sessions();

    let err = within("consumer exit", task).await.unwrap().unwrap_err();
    assert!(err.is_terminal(), "unexpected error: {err}");
    assert_eq!(broker.connect_attempts(), 1 + 3);
}

#[tokio::test]
async fn handler_failure_is_logged_even_when_settling_fails() {
    let logs = LogCapture::default();
    let _guard = tracing::subscriber::set_default(logs.subscriber());
    let broker = MemoryBroker::new();
    broker.put_job(Job::new(7, "jobs", "bad"));
    let registry = registry_for(&broker).await;
    let channel = registry.create_channel(Some("jobs")).await.unwrap();
    broker.fail_deletes(1);

    let handler = handler_fn(|_job: Job| async { Err::<(), _>(anyhow::anyhow!("upstream returned 503")) });
    let consumer = Consumer::new(channel, handler).with_options(fast_options(FailurePolicy::Delete));
    let cancel = consumer.cancellation_token();
    let stopper = {
        let logs = logs.clone();
        tokio::spawn(async move {
            eventually("cycle failure logged", || logs.contents().contains("consumer cycle failed")).await;
            cancel.cancel();
        })
    };
    let report = within("consumer stop", consumer.run()).await.unwrap();
    stopper.await.unwrap();

    let output = logs.contents();
    assert!(output.contains("job failed"), "{output}");
    assert!(output.contains("processing job 7 failed: upstream returned 503"), "{output}");
    assert!(output.contains("delete failed"), "{output}");
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors, 1);
    assert!(broker.deleted().is_empty());
    assert_eq!(broker.reserved_len("jobs"), 1);
}

#[tokio::test]
async fn panicking_handler_fails_the_job_and_the_loop_continues() {
    let broker = MemoryBroker::new();
    broker.put_job(Job::new(1, "jobs", "explodes"));
    broker.put_job(Job::new(2, "jobs", "fine"));
    let registry = registry_for(&broker).await;
    let channel = registry.create_channel(Some("jobs")).await.unwrap();

    let handler = handler_fn(|job: Job| async move {
        if job.id == JobId(1) {
            panic!("handler bug on job {}", job.id);
        }
        Ok(())
    });
    let consumer = Consumer::new(channel, handler).with_options(fast_options(FailurePolicy::Delete));
    let cancel = consumer.cancellation_token();
    let task = tokio::spawn(consumer.run());

    eventually("both jobs deleted", || broker.deleted().len() == 2).await;
    cancel.cancel();
    let report = within("consumer stop", task).await.unwrap().unwrap();

    assert_eq!(broker.deleted(), vec![JobId(1), JobId(2)]);
    assert_eq!(broker.reserved_len("jobs"), 0);
    assert_eq!(report.failed, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.errors, 0);
}
