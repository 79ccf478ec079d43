//! Bounded worker pool with a single producer and an in-caller aggregator
//!
//! Workers are tasks on one `JoinSet` sharing a single input queue. Results
//! travel back on a second channel and are drained by the caller, so only
//! the aggregator ever touches shared state. Every task is joined before
//! return.

use std::future::Future;
use std::sync::Arc;

use stackfile_core::ReleaseSpec;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::document::HelmDefaults;

/// Run `item_count` items through at most `concurrency` worker tasks.
///
/// `produce` queues the items; the queue closes when it returns.
/// `consume(worker_index, item)` runs on a worker. `aggregate` receives
/// exactly `item_count` results in completion order, fewer only when a
/// worker panicked.
pub async fn scatter_gather<T, R, Fut, Out>(
    concurrency: usize,
    item_count: usize,
    produce: impl FnOnce(mpsc::UnboundedSender<T>),
    consume: impl Fn(usize, T) -> Fut + Send + Sync + 'static,
    aggregate: impl FnOnce(&mut dyn Iterator<Item = R>) -> Out,
) -> Out
where
    T: Send + 'static,
    R: Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    if item_count == 0 {
        return aggregate(&mut std::iter::empty());
    }

    let workers = concurrency.clamp(1, item_count);
    tracing::debug!(workers, items = item_count, "scatter");

    let (input_tx, input_rx) = mpsc::unbounded_channel::<T>();
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<R>();
    produce(input_tx);

    let input_rx = Arc::new(Mutex::new(input_rx));
    let consume = Arc::new(consume);
    let mut tasks = JoinSet::new();
    for worker_index in 0..workers {
        let input_rx = Arc::clone(&input_rx);
        let output_tx = output_tx.clone();
        let consume = Arc::clone(&consume);
        tasks.spawn(async move {
            loop {
                let Some(item) = input_rx.lock().await.recv().await else {
                    break;
                };
                // The aggregator may stop early; nothing to do then.
                if output_tx.send((*consume)(worker_index, item).await).is_err() {
                    break;
                }
            }
        });
    }
    drop(output_tx);

    let mut results = Vec::with_capacity(item_count);
    while results.len() < item_count {
        match output_rx.recv().await {
            Some(result) => results.push(result),
            None => break,
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "scatter worker panicked");
        }
    }

    aggregate(&mut results.into_iter())
}

/// Worker count for a batch: one when any release runs tillerless
pub fn effective_concurrency(requested: usize, releases: &[&ReleaseSpec], defaults: &HelmDefaults) -> usize {
    let tillerless = releases
        .iter()
        .any(|r| r.tillerless.unwrap_or(defaults.tillerless));
    if tillerless {
        if requested != 1 {
            tracing::debug!("tillerless releases in batch, running serially");
        }
        return 1;
    }
    if requested == 0 { releases.len().max(1) } else { requested }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_item_is_consumed_once() {
        let sum = scatter_gather(
            4,
            100,
            |tx| {
                for i in 0..100u64 {
                    tx.send(i).unwrap();
                }
            },
            |_, i| async move { i * 2 },
            |results| results.sum::<u64>(),
        )
        .await;
        assert_eq!(sum, 9900);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_count_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let workers = scatter_gather(
            3,
            12,
            |tx| {
                for i in 0..12 {
                    tx.send(i).unwrap();
                }
            },
            move |worker, _| {
                let (active, peak) = (a.clone(), p.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    worker
                }
            },
            |results| results.collect::<HashSet<_>>(),
        )
        .await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) > 1);
        assert!(workers.iter().all(|w| *w < 3));
    }

    #[tokio::test]
    async fn test_concurrency_is_clamped_to_items() {
        let workers = scatter_gather(
            16,
            2,
            |tx| {
                tx.send(()).unwrap();
                tx.send(()).unwrap();
            },
            |worker, _| async move { worker },
            |results| results.collect::<Vec<_>>(),
        )
        .await;
        assert!(workers.iter().all(|w| *w < 2));

        let serial = scatter_gather(
            0,
            1,
            |tx| tx.send(1).unwrap(),
            |w, _: i32| async move { w },
            |r| r.collect::<Vec<_>>(),
        )
        .await;
        assert_eq!(serial, vec![0]);
    }

    #[tokio::test]
    async fn test_empty_input_calls_aggregate() {
        let count = scatter_gather(
            4,
            0,
            |_tx: mpsc::UnboundedSender<i32>| {},
            |_, i| async move { i },
            |results| results.count(),
        )
        .await;
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_panicking_worker_does_not_hang_the_aggregate() {
        let results = scatter_gather(
            2,
            3,
            |tx| {
                for i in 0..3 {
                    tx.send(i).unwrap();
                }
            },
            |_, i: i32| async move {
                if i == 1 {
                    panic!("worker failure");
                }
                i
            },
            |results| results.collect::<Vec<_>>(),
        )
        .await;
        assert!(results.len() < 3);
        assert!(!results.contains(&1));
    }

    #[test]
    fn test_tillerless_forces_serial() {
        let mut a = ReleaseSpec::new("a", "x/a");
        let b = ReleaseSpec::new("b", "x/b");
        let defaults = HelmDefaults::default();

        assert_eq!(effective_concurrency(8, &[&a, &b], &defaults), 8);
        assert_eq!(effective_concurrency(0, &[&a, &b], &defaults), 2);

        a.tillerless = Some(true);
        assert_eq!(effective_concurrency(8, &[&a, &b], &defaults), 1);

        let defaults = HelmDefaults {
            tillerless: true,
            ..Default::default()
        };
        assert_eq!(effective_concurrency(8, &[&b], &defaults), 1);
    }
}
