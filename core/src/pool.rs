//! Bounded-concurrency fan-out primitives.
//!
//! Two deliberately separate entry points: [`run_unordered`] drains a shared
//! queue and yields results in completion order, [`run_indexed`] writes
//! results by input position. They have different ordering contracts, so
//! callers pick one by name instead of relying on how a single pool happens
//! to behave.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Apply `f` to every item with at most `workers` concurrent executions.
///
/// Workers pull from a shared queue that closes when exhausted, and check the
/// token before each pull, so cancelling stops the pool within one in-flight
/// item per worker; queued-but-unstarted items are skipped, never re-run.
/// The result channel is sized to the item count so producers never block on
/// a slow collector. `f` returning `None` records nothing for that item.
///
/// Result order is unrelated to input order. Callers that need positional
/// correspondence must use [`run_indexed`].
pub async fn run_unordered<T, R, F, Fut>(
    cancel: &CancellationToken,
    items: Vec<T>,
    workers: usize,
    f: F,
) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Option<R>> + Send + 'static,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let (tx, mut rx) = mpsc::channel::<R>(total);
    let workers = workers.clamp(1, total);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = queue.clone();
        let tx = tx.clone();
        let cancel = cancel.clone();
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let item = queue.lock().unwrap().pop_front();
                let Some(item) = item else { break };
                if let Some(result) = f(item).await {
                    if tx.send(result).await.is_err() {
                        break;
                    }
                }
            }
        }));
    }
    // The workers hold the remaining senders; the channel closes once the
    // last of them exits.
    drop(tx);

    let mut results = Vec::with_capacity(total);
    while let Some(r) = rx.recv().await {
        results.push(r);
    }
    for h in handles {
        let _ = h.await;
    }
    results
}

/// Apply `f` to every item with at most `workers` concurrent executions,
/// preserving input positions: slot `i` of the output is the result for
/// `items[i]`, or `None` when cancellation skipped it.
pub async fn run_indexed<T, R, F, Fut>(
    cancel: &CancellationToken,
    items: Vec<T>,
    workers: usize,
    f: F,
) -> Vec<Option<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = items.len();
    let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
    if total == 0 {
        return results;
    }

    let sem = Arc::new(Semaphore::new(workers.max(1)));
    let mut set: JoinSet<(usize, Option<R>)> = JoinSet::new();

    for (idx, item) in items.into_iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let permit = sem.clone().acquire_owned().await.unwrap();
        let cancel = cancel.clone();
        let f = f.clone();
        set.spawn(async move {
            let _permit = permit;
            if cancel.is_cancelled() {
                return (idx, None);
            }
            (idx, Some(f(item).await))
        });
    }

    while let Some(joined) = set.join_next().await {
        if let Ok((idx, result)) = joined {
            results[idx] = result;
        }
    }
    results
}
