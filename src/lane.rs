//! Serial execution lanes and the quiescence barrier.
//!
//! Every ordering guarantee in this crate reduces to a small set of
//! single-consumer FIFO lanes: the context lane, the bus lane and the shared
//! read/write lane. A lane is an OS thread pinned to an unbounded channel;
//! jobs run to completion in submission order, and cross-lane hand-offs are
//! the only points where ordering between subsystems is defined.

use futures::future::BoxFuture;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// A named FIFO lane owning a piece of state of type `S`.
///
/// Cloning shares the same lane. The lane thread exits once every clone is
/// dropped and the queue has drained, so tear-down is the natural consequence
/// of releasing the owners.
pub(crate) struct SerialLane<S> {
    tx: mpsc::Sender<Job<S>>,
}

impl<S> Clone for SerialLane<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: Send + 'static> SerialLane<S> {
    /// Spawn the lane thread and take ownership of `state`.
    pub fn spawn(name: &str, state: S) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job<S>>();
        thread::Builder::new()
            .name(format!("relaykit-{name}"))
            .spawn(move || {
                let mut state = state;
                while let Ok(job) = rx.recv() {
                    job(&mut state);
                }
            })?;
        Ok(Self { tx })
    }

    /// Enqueue a job. Jobs run one at a time, in submission order.
    ///
    /// After tear-down the lane thread is gone and the job is dropped; by then
    /// the harvest barrier has already observed quiescence, so nothing that
    /// matters can still be enqueued.
    pub fn post(&self, job: impl FnOnce(&mut S) + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }

    /// A barrier leaf that resolves once every job submitted before this call
    /// has completed.
    pub fn barrier(&self) -> QuiescenceBarrier {
        let tx = self.tx.clone();
        QuiescenceBarrier::from_installer(move |done| {
            let _ = tx.send(Box::new(move |_state: &mut S| done()));
        })
    }
}

type Installer = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// Composable quiescence primitive over serial queues.
///
/// A barrier value knows how to install a callback at the end of its
/// underlying queue. [`sequence`](Self::sequence) awaits parts in order,
/// installing each one only after the previous part quiesced, so work
/// scheduled from an earlier queue onto a later one is always observed.
/// [`group`](Self::group) awaits parts concurrently.
#[derive(Clone)]
pub struct QuiescenceBarrier {
    kind: BarrierKind,
}

#[derive(Clone)]
enum BarrierKind {
    Leaf(Installer),
    Sequence(Vec<QuiescenceBarrier>),
    Group(Vec<QuiescenceBarrier>),
}

impl QuiescenceBarrier {
    /// Build a barrier leaf from an installer that enqueues a callback at the
    /// end of some serial queue.
    ///
    /// Features with their own background queues implement the continuation
    /// contract by returning one of these from
    /// [`Feature::quiescence_barrier`](crate::core::Feature::quiescence_barrier).
    pub fn from_installer(
        install: impl Fn(Box<dyn FnOnce() + Send>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: BarrierKind::Leaf(Arc::new(install)),
        }
    }

    /// Await each part in order.
    pub fn sequence(parts: Vec<QuiescenceBarrier>) -> Self {
        Self {
            kind: BarrierKind::Sequence(parts),
        }
    }

    /// Await all parts concurrently.
    pub fn group(parts: Vec<QuiescenceBarrier>) -> Self {
        Self {
            kind: BarrierKind::Group(parts),
        }
    }

    /// Resolve once the composed queues have quiesced.
    ///
    /// If an underlying queue is already gone (torn down), the leaf resolves
    /// immediately: an absent queue is a quiescent queue.
    pub fn wait(self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            match self.kind {
                BarrierKind::Leaf(install) => {
                    let (tx, rx) = oneshot::channel();
                    install(Box::new(move || {
                        let _ = tx.send(());
                    }));
                    let _ = rx.await;
                }
                BarrierKind::Sequence(parts) => {
                    for part in parts {
                        part.wait().await;
                    }
                }
                BarrierKind::Group(parts) => {
                    futures::future::join_all(parts.into_iter().map(QuiescenceBarrier::wait))
                        .await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let lane = SerialLane::spawn("test", Vec::<u32>::new()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = seen.clone();
            lane.post(move |state| {
                state.push(i);
                seen.lock().push(i);
            });
        }
        lane.barrier().wait().await;

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn barrier_waits_for_previously_posted_jobs() {
        let lane = SerialLane::spawn("test", ()).unwrap();
        let done = Arc::new(Mutex::new(false));

        let flag = done.clone();
        lane.post(move |_| {
            std::thread::sleep(Duration::from_millis(50));
            *flag.lock() = true;
        });
        lane.barrier().wait().await;

        assert!(*done.lock());
    }

    #[tokio::test]
    async fn sequence_observes_work_scheduled_across_lanes() {
        // A job on lane A schedules a job on lane B. Awaiting A then B must
        // observe the B job, even though it was not yet enqueued when the
        // composed barrier was built.
        let lane_a = SerialLane::spawn("a", ()).unwrap();
        let lane_b = SerialLane::spawn("b", ()).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let b = lane_b.clone();
        let order_a = order.clone();
        let order_b = order.clone();
        lane_a.post(move |_| {
            order_a.lock().push("a");
            b.post(move |_| {
                std::thread::sleep(Duration::from_millis(20));
                order_b.lock().push("b");
            });
        });

        QuiescenceBarrier::sequence(vec![lane_a.barrier(), lane_b.barrier()])
            .wait()
            .await;

        assert_eq!(*order.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn group_awaits_all_parts() {
        let lanes: Vec<_> = (0..3)
            .map(|i| SerialLane::spawn(&format!("g{i}"), ()).unwrap())
            .collect();
        let count = Arc::new(Mutex::new(0));

        for lane in &lanes {
            let count = count.clone();
            lane.post(move |_| {
                std::thread::sleep(Duration::from_millis(10));
                *count.lock() += 1;
            });
        }
        QuiescenceBarrier::group(lanes.iter().map(|l| l.barrier()).collect())
            .wait()
            .await;

        assert_eq!(*count.lock(), 3);
    }
}
