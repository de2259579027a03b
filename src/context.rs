//! The evolving context snapshot behind its serial access queue.

use crate::lane::{QuiescenceBarrier, SerialLane};
use crate::platform::Publisher;
use crate::types::Context;
use std::io;
use std::sync::Arc;
use tokio::sync::oneshot;

struct ContextState {
    context: Context,
    /// Pull sources evaluated at the start of every read.
    refreshers: Vec<Box<dyn Fn(&mut Context) + Send>>,
    /// Invoked after each committed write with the new snapshot.
    on_change: Option<Box<dyn Fn(&Context) + Send>>,
}

/// Owns one [`Context`] value and serializes every access through a dedicated
/// lane.
///
/// Guarantees: each snapshot passed to a [`read`](Self::read) callback is
/// internally consistent, and a [`write`](Self::write) that completes before
/// a read is enqueued is visible to that read.
#[derive(Clone)]
pub(crate) struct ContextProvider {
    lane: SerialLane<ContextState>,
}

impl ContextProvider {
    pub(crate) fn new(initial: Context) -> io::Result<Self> {
        let lane = SerialLane::spawn(
            "context",
            ContextState {
                context: initial,
                refreshers: Vec::new(),
                on_change: None,
            },
        )?;
        Ok(Self { lane })
    }

    /// Install the hook invoked with every new snapshot. The core uses this
    /// to broadcast context messages on the bus.
    pub(crate) fn set_change_hook(&self, hook: impl Fn(&Context) + Send + 'static) {
        self.lane.post(move |state| state.on_change = Some(Box::new(hook)));
    }

    /// Schedule `f` with a consistent snapshot. Pull-assigned fields are
    /// refreshed first. The callback runs on the context lane and may call
    /// writers safely.
    pub fn read(&self, f: impl FnOnce(&Context) + Send + 'static) {
        self.lane.post(move |state| {
            for refresh in &state.refreshers {
                refresh(&mut state.context);
            }
            f(&state.context);
        });
    }

    /// Schedule a mutation. After it runs, the new snapshot is published
    /// through the change hook.
    pub fn write(&self, f: impl FnOnce(&mut Context) + Send + 'static) {
        self.lane.post(move |state| {
            f(&mut state.context);
            state.context.snapshot_version += 1;
            if let Some(on_change) = &state.on_change {
                on_change(&state.context);
            }
        });
    }

    /// Async convenience over [`read`](Self::read): resolve to a snapshot
    /// clone. Resolves to the default context after tear-down.
    pub async fn current(&self) -> Context {
        let (tx, rx) = oneshot::channel();
        self.read(move |context| {
            let _ = tx.send(context.clone());
        });
        rx.await.unwrap_or_default()
    }

    /// Bind a context field to a push source. Each emitted value is merged on
    /// the context lane via `apply` and published like any other write.
    pub fn subscribe<T: Send + 'static>(
        &self,
        publisher: Box<dyn Publisher<Value = T>>,
        apply: impl Fn(&mut Context, T) + Send + Sync + 'static,
    ) {
        let provider = self.clone();
        let apply = Arc::new(apply);
        publisher.subscribe(Box::new(move |value| {
            let apply = apply.clone();
            provider.write(move |context| apply(context, value));
        }));
    }

    /// Bind a pull source evaluated lazily on each read.
    pub fn assign(&self, refresh: impl Fn(&mut Context) + Send + 'static) {
        self.lane
            .post(move |state| state.refreshers.push(Box::new(refresh)));
    }

    pub(crate) fn barrier(&self) -> QuiescenceBarrier {
        self.lane.barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ManualPublisher;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn write_enqueued_before_read_is_visible() {
        let provider = ContextProvider::new(Context::default()).unwrap();

        provider.write(|context| context.service = "checkout".into());
        let snapshot = provider.current().await;

        assert_eq!(snapshot.service, "checkout");
    }

    #[tokio::test]
    async fn snapshot_versions_are_monotonic() {
        let provider = ContextProvider::new(Context::default()).unwrap();
        let versions = Arc::new(Mutex::new(Vec::new()));

        let sink = versions.clone();
        provider.set_change_hook(move |context| sink.lock().push(context.snapshot_version));
        provider.barrier().wait().await;

        for i in 0..5u64 {
            provider.write(move |context| context.server_time_offset_ms = i as i64);
        }
        provider.barrier().wait().await;

        let seen = versions.lock().clone();
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn subscribed_publisher_merges_values() {
        let provider = ContextProvider::new(Context::default()).unwrap();
        let (publisher, handle) = ManualPublisher::<bool>::new();

        provider.subscribe(Box::new(publisher), |context, low_power| {
            context.low_power_mode = low_power;
        });
        handle.emit(true);

        assert!(provider.current().await.low_power_mode);
    }

    #[tokio::test]
    async fn assigned_reader_refreshes_on_each_read() {
        let provider = ContextProvider::new(Context::default()).unwrap();
        let ticks = Arc::new(Mutex::new(0i64));

        let source = ticks.clone();
        provider.assign(move |context| {
            let mut ticks = source.lock();
            *ticks += 1;
            context.server_time_offset_ms = *ticks;
        });

        assert_eq!(provider.current().await.server_time_offset_ms, 1);
        assert_eq!(provider.current().await.server_time_offset_ms, 2);
    }
}
