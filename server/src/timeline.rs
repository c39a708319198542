//! The server's single cooperative task queue.
//!
//! One worker owns the context value and drains a deadline min-heap,
//! running each task to completion before the next. Because every mutation
//! runs here, the model needs no lock. Tasks receive the handle back so
//! they can reschedule themselves; there is no cancellation.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// A unit of work executed on the timeline worker.
pub type Task<C> = Box<dyn FnOnce(&mut C, &Timeline<C>) + Send + 'static>;

struct Scheduled<C> {
    due: Instant,
    /// Tie-breaker: equal deadlines run in scheduling order.
    seq: u64,
    task: Task<C>,
}

impl<C> PartialEq for Scheduled<C> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<C> Eq for Scheduled<C> {}

impl<C> PartialOrd for Scheduled<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Scheduled<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

/// Cloneable handle for scheduling work onto the worker.
pub struct Timeline<C> {
    tx: mpsc::UnboundedSender<Scheduled<C>>,
    seq: Arc<AtomicU64>,
}

impl<C> Clone for Timeline<C> {
    fn clone(&self) -> Self {
        Timeline {
            tx: self.tx.clone(),
            seq: self.seq.clone(),
        }
    }
}

impl<C: Send + 'static> Timeline<C> {
    /// Spawn the worker owning `ctx` and return a scheduling handle.
    pub fn spawn(ctx: C) -> Timeline<C> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Timeline {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        };
        let worker_handle = handle.clone();
        tokio::spawn(run(ctx, worker_handle, rx));
        handle
    }

    /// Enqueue a task to run as soon as possible.
    pub fn schedule_now(&self, task: impl FnOnce(&mut C, &Timeline<C>) + Send + 'static) {
        self.schedule_at(Instant::now(), Box::new(task));
    }

    /// Enqueue a task to run after at least `delay`.
    pub fn schedule_in(
        &self,
        delay: Duration,
        task: impl FnOnce(&mut C, &Timeline<C>) + Send + 'static,
    ) {
        self.schedule_at(Instant::now() + delay, Box::new(task));
    }

    fn schedule_at(&self, due: Instant, task: Task<C>) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        // Fails only once the worker is gone, i.e. during shutdown.
        let _ = self.tx.send(Scheduled { due, seq, task });
    }
}

async fn run<C: Send + 'static>(
    mut ctx: C,
    handle: Timeline<C>,
    mut rx: mpsc::UnboundedReceiver<Scheduled<C>>,
) {
    let mut queue: BinaryHeap<Reverse<Scheduled<C>>> = BinaryHeap::new();

    loop {
        // Run everything whose deadline has passed, one task at a time.
        while queue
            .peek()
            .map_or(false, |Reverse(next)| next.due <= Instant::now())
        {
            if let Some(Reverse(scheduled)) = queue.pop() {
                (scheduled.task)(&mut ctx, &handle);
            }
        }

        let next_due = queue.peek().map(|Reverse(next)| next.due);
        match next_due {
            None => match rx.recv().await {
                Some(scheduled) => queue.push(Reverse(scheduled)),
                None => break,
            },
            Some(due) => {
                tokio::select! {
                    incoming = rx.recv() => match incoming {
                        Some(scheduled) => queue.push(Reverse(scheduled)),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(due) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    /// Snapshot the context through a final scheduled task.
    async fn snapshot(timeline: &Timeline<Vec<u32>>) -> Vec<u32> {
        let (tx, rx) = oneshot::channel();
        timeline.schedule_now(move |ctx, _| {
            let _ = tx.send(ctx.clone());
        });
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_tasks_run_in_scheduling_order() {
        let timeline = Timeline::spawn(Vec::new());
        for i in 1..=3 {
            timeline.schedule_now(move |ctx, _| ctx.push(i));
        }
        assert_eq!(snapshot(&timeline).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_schedule_in_waits_at_least_the_delay() {
        let timeline = Timeline::spawn(Vec::<u32>::new());
        let (tx, rx) = oneshot::channel();
        let start = std::time::Instant::now();
        timeline.schedule_in(Duration::from_millis(40), move |_, _| {
            let _ = tx.send(start.elapsed());
        });
        let elapsed = rx.await.unwrap();
        assert!(elapsed >= Duration::from_millis(40), "ran after {elapsed:?}");
    }

    #[tokio::test]
    async fn test_immediate_task_overtakes_delayed_one() {
        let timeline = Timeline::spawn(Vec::new());
        timeline.schedule_in(Duration::from_millis(30), |ctx: &mut Vec<u32>, _| ctx.push(2));
        timeline.schedule_now(|ctx, _| ctx.push(1));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(snapshot(&timeline).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_tasks_can_reschedule_themselves() {
        fn tick(ctx: &mut Vec<u32>, timeline: &Timeline<Vec<u32>>) {
            let round = ctx.len() as u32 + 1;
            ctx.push(round);
            if round < 3 {
                timeline.schedule_in(Duration::from_millis(5), tick);
            }
        }

        let timeline = Timeline::spawn(Vec::new());
        timeline.schedule_now(tick);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(snapshot(&timeline).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_mutations_are_serialized() {
        let timeline = Timeline::spawn(Vec::new());
        for i in 0..100 {
            timeline.schedule_now(move |ctx, _| ctx.push(i));
        }
        let seen = snapshot(&timeline).await;
        assert_eq!(seen, (0..100).collect::<Vec<u32>>());
    }
}
