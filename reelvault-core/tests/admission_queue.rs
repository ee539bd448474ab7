use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;

use reelvault_core::queue::{AdmissionConfig, AdmissionQueue, ProcessingJob, SubmitError};

fn queue(max_concurrent: usize, max_queue_size: usize) -> AdmissionQueue {
    AdmissionQueue::new(AdmissionConfig {
        max_concurrent,
        max_queue_size,
        job_timeout: Duration::from_secs(30),
    })
}

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn concurrency_never_exceeds_limit() {
    let queue = queue(3, 64);
    let gauge = Arc::new(Gauge::default());

    let submissions = (0..24).map(|n| {
        let gauge = Arc::clone(&gauge);
        let queue = queue.clone();
        async move {
            let job = ProcessingJob::<usize, String>::new(format!("job-{n}"), move || async move {
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(5)).await;
                gauge.leave();
                Ok(n)
            });
            queue.submit(job).await
        }
    });
    let results = join_all(submissions).await;

    assert!(results.iter().all(|result| result.is_ok()));
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
    let status = queue.status();
    assert_eq!(status.running, 0);
    assert_eq!(status.waiting, 0);
}

#[tokio::test]
async fn full_queue_rejects_without_invoking_job() {
    let queue = queue(1, 2);
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);

    let holders: Vec<_> = (0..2)
        .map(|n| {
            let queue = queue.clone();
            let mut release = release_rx.clone();
            tokio::spawn(async move {
                queue
                    .submit(ProcessingJob::<(), String>::new(format!("hold-{n}"), move || async move {
                        let _ = release.wait_for(|open| *open).await;
                        Ok(())
                    }))
                    .await
            })
        })
        .collect();
    while queue.status().running + queue.status().waiting < 2 {
        tokio::task::yield_now().await;
    }

    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invoked);
    let rejected = queue
        .submit(ProcessingJob::<(), String>::new("overflow", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .await;
    match rejected {
        Err(SubmitError::QueueFull {
            waiting,
            running,
            limit,
        }) => {
            assert_eq!((waiting, running, limit), (1, 1, 2));
        }
        other => panic!("expected QueueFull, got {other:?}"),
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    release_tx.send(true).unwrap();
    for holder in holders {
        holder.await.unwrap().unwrap();
    }
    assert!(!queue.status().queue_full);
}

#[tokio::test]
async fn waiters_are_admitted_in_arrival_order() {
    let queue = queue(1, 16);
    let order = Arc::new(Mutex::new(Vec::new()));

    let submissions = (0..8).map(|n| {
        let order = Arc::clone(&order);
        let queue = queue.clone();
        async move {
            queue
                .submit(ProcessingJob::<(), String>::new(format!("ordered-{n}"), move || async move {
                    order.lock().push(n);
                    tokio::task::yield_now().await;
                    Ok(())
                }))
                .await
        }
    });
    join_all(submissions).await;

    assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
}

#[tokio::test]
async fn slots_are_reused_across_many_short_jobs() {
    let queue = queue(2, 4);
    let completed = Arc::new(AtomicUsize::new(0));
    for n in 0..2_000 {
        let completed = Arc::clone(&completed);
        queue
            .submit(ProcessingJob::<(), String>::new(format!("short-{n}"), move || async move {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await
            .unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 2_000);
    assert_eq!(queue.status().running, 0);
}

#[tokio::test]
async fn failed_job_frees_its_slot() {
    let queue = queue(1, 2);
    let failing = ProcessingJob::<(), String>::new("fails", || async { Err("nope".to_string()) });
    assert!(matches!(queue.submit(failing).await, Err(SubmitError::Job(_))));

    let next = ProcessingJob::<u8, String>::new("next", || async { Ok(7) });
    assert_eq!(queue.submit(next).await.unwrap(), 7);
}
