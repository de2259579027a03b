//! Periodic per-feature upload worker with adaptive delay.

use crate::bus::Telemetry;
use crate::config::PerformancePreset;
use crate::context::ContextProvider;
use crate::error::TransportError;
use crate::http::{HttpClient, HttpRequest, RequestBuilder};
use crate::platform::BackgroundTaskCoordinator;
use crate::storage::{BatchResolution, Storage};
use crate::types::{AppState, BatteryState, Context, NetworkReachability, TrackingConsent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Battery level below which uploads pause, unless the device is charging.
const MIN_BATTERY_LEVEL: f32 = 0.1;

/// Gate evaluated before each upload attempt.
#[derive(Clone, Copy, Debug)]
pub(crate) struct UploadConditions {
    pub min_battery_level: f32,
    /// Keep uploading while the device reports low-power mode.
    pub low_power_override: bool,
}

impl Default for UploadConditions {
    fn default() -> Self {
        Self {
            min_battery_level: MIN_BATTERY_LEVEL,
            low_power_override: false,
        }
    }
}

impl UploadConditions {
    pub fn can_upload(&self, context: &Context) -> bool {
        if context.tracking_consent == TrackingConsent::NotGranted {
            return false;
        }
        if context.network_reachability == NetworkReachability::No {
            return false;
        }
        match context.battery {
            // Plugged-in devices upload regardless of level or low-power mode.
            Some(battery) if !matches!(battery.state, BatteryState::Charging | BatteryState::Full) => {
                battery.level >= self.min_battery_level
                    && (!context.low_power_mode || self.low_power_override)
            }
            _ => true,
        }
    }
}

/// Delay between upload ticks, bounded by the preset and adapted
/// multiplicatively: shrinking on success, growing on retryable failure.
#[derive(Clone, Debug)]
pub(crate) struct UploadDelay {
    current: Duration,
    min: Duration,
    max: Duration,
    rate: f64,
}

impl UploadDelay {
    pub fn new(preset: &PerformancePreset) -> Self {
        Self {
            current: preset
                .initial_upload_delay
                .clamp(preset.min_upload_delay, preset.max_upload_delay),
            min: preset.min_upload_delay,
            max: preset.max_upload_delay,
            rate: preset.upload_delay_change_rate,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn increase(&mut self) {
        self.current = self.current.mul_f64(1.0 + self.rate).min(self.max);
    }

    pub fn decrease(&mut self) {
        self.current = self.current.mul_f64(1.0 - self.rate).max(self.min);
    }
}

/// Response classification, by status code only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UploadOutcome {
    /// 2xx: the batch is delivered and deleted.
    Success(u16),
    /// Transient: the batch is kept and the delay backs off. `None` for
    /// transport-level failures.
    Retryable(Option<u16>),
    /// The intake rejected the payload for good; retrying cannot help.
    Unrecoverable(u16),
}

impl UploadOutcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => UploadOutcome::Success(status),
            408 | 429 => UploadOutcome::Retryable(Some(status)),
            400..=499 => UploadOutcome::Unrecoverable(status),
            500..=599 => UploadOutcome::Retryable(Some(status)),
            other => UploadOutcome::Unrecoverable(other),
        }
    }

    pub fn from_transport(err: &TransportError) -> Self {
        match err {
            TransportError::Timeout | TransportError::Network(_) => UploadOutcome::Retryable(None),
        }
    }
}

struct UploadShared {
    feature: String,
    storage: Arc<Storage>,
    context: ContextProvider,
    client: Arc<dyn HttpClient>,
    request_builder: Arc<dyn RequestBuilder>,
    conditions: UploadConditions,
    delay: Mutex<UploadDelay>,
    background: Option<Arc<dyn BackgroundTaskCoordinator>>,
    /// Keeps periodic ticks and the synchronous flush mutually exclusive, so
    /// a batch is never submitted twice concurrently.
    attempt: tokio::sync::Mutex<()>,
    telemetry: Telemetry,
}

/// Drains one feature's storage to the intake.
///
/// The loop keeps a single pending delayed tick at a time; tearing the core
/// down cancels it at the next scheduling point.
#[derive(Clone)]
pub(crate) struct UploadWorker {
    shared: Arc<UploadShared>,
    shutdown: watch::Sender<bool>,
}

impl UploadWorker {
    /// Spawn the upload loop. Must be called within a tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        feature: impl Into<String>,
        storage: Arc<Storage>,
        context: ContextProvider,
        client: Arc<dyn HttpClient>,
        request_builder: Arc<dyn RequestBuilder>,
        preset: &PerformancePreset,
        background: Option<Arc<dyn BackgroundTaskCoordinator>>,
        telemetry: Telemetry,
    ) -> Self {
        let shared = Arc::new(UploadShared {
            feature: feature.into(),
            storage,
            context,
            client,
            request_builder,
            conditions: UploadConditions {
                low_power_override: preset.low_power_override,
                ..UploadConditions::default()
            },
            delay: Mutex::new(UploadDelay::new(preset)),
            background,
            attempt: tokio::sync::Mutex::new(()),
            telemetry,
        });
        let (shutdown, mut rx) = watch::channel(false);

        let worker = shared.clone();
        tokio::spawn(async move {
            loop {
                let wait = worker.delay.lock().current();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let _permit = worker.attempt.lock().await;
                worker.tick().await;
            }
            tracing::debug!(feature = %worker.feature, "upload loop stopped");
        });

        Self { shared, shutdown }
    }

    /// Stop the loop at its next scheduling point.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    #[cfg(test)]
    pub(crate) fn current_delay(&self) -> Duration {
        self.shared.delay.lock().current()
    }

    /// Drain every batch, ignoring the minimum file age and deleting each one
    /// regardless of the response. Intended for tear-down; transient failures
    /// lose their data by design here.
    pub async fn flush_synchronously(&self) {
        let shared = &self.shared;
        let _permit = shared.attempt.lock().await;
        let context = shared.context.current().await;
        while let Some(batch) = shared.storage.next_batch().await {
            match shared.request_builder.build(&batch.events, &context) {
                Ok(request) => {
                    let _ = shared.submit(request, &context).await;
                }
                Err(err) => {
                    shared
                        .telemetry
                        .error(format!("request builder failed during flush: {err}"));
                }
            }
            shared.storage.confirm(batch.id, BatchResolution::Delete);
        }
    }
}

impl UploadShared {
    async fn tick(&self) {
        let context = self.context.current().await;
        if !self.conditions.can_upload(&context) {
            tracing::debug!(feature = %self.feature, "upload blocked by conditions");
            return;
        }
        let Some(batch) = self.storage.next_batch().await else {
            self.delay.lock().increase();
            return;
        };
        let id = batch.id.clone();
        let request = match self.request_builder.build(&batch.events, &context) {
            Ok(request) => request,
            Err(err) => {
                self.telemetry
                    .error(format!("request builder failed, dropping batch {id}: {err}"));
                self.storage.confirm(id, BatchResolution::Delete);
                return;
            }
        };
        match self.submit(request, &context).await {
            UploadOutcome::Success(status) => {
                self.telemetry
                    .debug(format!("uploaded batch {id} with status {status}"));
                self.storage.confirm(id, BatchResolution::Delete);
                self.delay.lock().decrease();
            }
            UploadOutcome::Unrecoverable(status) => {
                self.telemetry
                    .error(format!("intake rejected batch {id} with status {status}"));
                self.storage.confirm(id, BatchResolution::Delete);
            }
            UploadOutcome::Retryable(status) => {
                tracing::debug!(
                    feature = %self.feature,
                    ?status,
                    "transient failure, batch {id} kept"
                );
                self.storage.confirm(id, BatchResolution::Keep);
                self.delay.lock().increase();
            }
        }
    }

    /// Submit one request. When background tasks are enabled and the app has
    /// entered background, an OS lease is held around the in-flight request.
    async fn submit(&self, request: HttpRequest, context: &Context) -> UploadOutcome {
        let lease = self.background.as_ref().filter(|_| {
            context.app_state_history.current_state() == AppState::Background
        });
        if let Some(background) = lease {
            background.begin_task();
        }
        let result = self.client.send(request).await;
        if let Some(background) = lease {
            background.end_task();
        }
        match result {
            Ok(response) => UploadOutcome::from_status(response.status),
            Err(err) => UploadOutcome::from_transport(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::lane::SerialLane;
    use crate::testutil::{LineRequestBuilder, MockHttpClient, TestClock};
    use crate::types::BatteryStatus;
    use tempfile::TempDir;

    #[test]
    fn classification_follows_status_ranges() {
        assert_eq!(UploadOutcome::from_status(202), UploadOutcome::Success(202));
        assert_eq!(
            UploadOutcome::from_status(408),
            UploadOutcome::Retryable(Some(408))
        );
        assert_eq!(
            UploadOutcome::from_status(429),
            UploadOutcome::Retryable(Some(429))
        );
        assert_eq!(
            UploadOutcome::from_status(400),
            UploadOutcome::Unrecoverable(400)
        );
        assert_eq!(
            UploadOutcome::from_status(503),
            UploadOutcome::Retryable(Some(503))
        );
        assert_eq!(
            UploadOutcome::from_transport(&TransportError::Timeout),
            UploadOutcome::Retryable(None)
        );
    }

    #[test]
    fn delay_adapts_within_bounds() {
        let preset = PerformancePreset {
            initial_upload_delay: Duration::from_secs(5),
            min_upload_delay: Duration::from_secs(4),
            max_upload_delay: Duration::from_secs(6),
            upload_delay_change_rate: 0.5,
            ..PerformancePreset::default()
        };
        let mut delay = UploadDelay::new(&preset);

        delay.increase();
        assert_eq!(delay.current(), Duration::from_secs(6));
        delay.increase();
        assert_eq!(delay.current(), Duration::from_secs(6));

        delay.decrease();
        delay.decrease();
        assert_eq!(delay.current(), Duration::from_secs(4));
    }

    #[test]
    fn conditions_gate_on_consent_network_and_battery() {
        let conditions = UploadConditions::default();
        let mut context = Context {
            network_reachability: NetworkReachability::Yes,
            tracking_consent: TrackingConsent::Granted,
            ..Context::default()
        };
        assert!(conditions.can_upload(&context));

        context.tracking_consent = TrackingConsent::NotGranted;
        assert!(!conditions.can_upload(&context));
        context.tracking_consent = TrackingConsent::Granted;

        context.network_reachability = NetworkReachability::No;
        assert!(!conditions.can_upload(&context));
        context.network_reachability = NetworkReachability::Maybe;
        assert!(conditions.can_upload(&context));

        context.battery = Some(BatteryStatus {
            state: BatteryState::Unplugged,
            level: 0.05,
        });
        assert!(!conditions.can_upload(&context));

        context.battery = Some(BatteryStatus {
            state: BatteryState::Charging,
            level: 0.05,
        });
        assert!(conditions.can_upload(&context));

        context.battery = Some(BatteryStatus {
            state: BatteryState::Unplugged,
            level: 0.9,
        });
        context.low_power_mode = true;
        assert!(!conditions.can_upload(&context));

        let overriding = UploadConditions {
            low_power_override: true,
            ..UploadConditions::default()
        };
        assert!(overriding.can_upload(&context));
    }

    struct CountingCoordinator {
        begun: std::sync::atomic::AtomicUsize,
        ended: std::sync::atomic::AtomicUsize,
    }

    impl CountingCoordinator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                begun: std::sync::atomic::AtomicUsize::new(0),
                ended: std::sync::atomic::AtomicUsize::new(0),
            })
        }
    }

    impl crate::platform::BackgroundTaskCoordinator for CountingCoordinator {
        fn begin_task(&self) {
            self.begun.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        fn end_task(&self) {
            self.ended.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn background_lease_wraps_requests_only_while_backgrounded() {
        let root = TempDir::new().unwrap();
        let clock = Arc::new(TestClock::default());
        let lane = SerialLane::spawn("rw-lease-test", ()).unwrap();
        let telemetry = Telemetry::new(MessageBus::new().unwrap(), "test");
        let storage = Arc::new(
            Storage::new(
                "test",
                root.path(),
                PerformancePreset::default(),
                None,
                clock.clone(),
                telemetry.clone(),
                lane,
            )
            .unwrap(),
        );
        let provider = ContextProvider::new(Context::default()).unwrap();
        let coordinator = CountingCoordinator::new();
        let preset = PerformancePreset {
            initial_upload_delay: Duration::from_secs(3600),
            max_upload_delay: Duration::from_secs(3600),
            ..PerformancePreset::default()
        };
        let worker = UploadWorker::spawn(
            "test",
            storage.clone(),
            provider.clone(),
            Arc::new(MockHttpClient::with_statuses(vec![200])),
            Arc::new(LineRequestBuilder::new("https://intake.test/v1")),
            &preset,
            Some(coordinator.clone()),
            telemetry,
        );
        storage.set_ignore_file_age_for_read(true);

        // Foreground: the request goes out without a lease.
        storage.writer(TrackingConsent::Granted, false).write("a");
        storage.barrier().wait().await;
        worker.flush_synchronously().await;
        assert_eq!(coordinator.begun.load(std::sync::atomic::Ordering::SeqCst), 0);

        // Backgrounded: the lease wraps the in-flight request.
        provider.write(|context| {
            context
                .app_state_history
                .append(AppState::Background, std::time::SystemTime::UNIX_EPOCH);
        });
        storage.writer(TrackingConsent::Granted, true).write("b");
        storage.barrier().wait().await;
        worker.flush_synchronously().await;
        worker.cancel();

        assert_eq!(coordinator.begun.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(coordinator.ended.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flush_deletes_batches_regardless_of_response() {
        let root = TempDir::new().unwrap();
        let clock = Arc::new(TestClock::default());
        let lane = SerialLane::spawn("rw-upload-test", ()).unwrap();
        let telemetry = Telemetry::new(MessageBus::new().unwrap(), "test");
        let storage = Arc::new(
            Storage::new(
                "test",
                root.path(),
                PerformancePreset::default(),
                None,
                clock.clone(),
                telemetry.clone(),
                lane,
            )
            .unwrap(),
        );
        storage.writer(TrackingConsent::Granted, false).write("a");
        storage.writer(TrackingConsent::Granted, true).write("b");
        storage.barrier().wait().await;

        // Every submission fails with a retryable status; the flush still
        // drains and deletes both batches.
        let client = Arc::new(MockHttpClient::with_statuses(vec![503, 503]));
        let preset = PerformancePreset {
            initial_upload_delay: Duration::from_secs(3600),
            max_upload_delay: Duration::from_secs(3600),
            ..PerformancePreset::default()
        };
        let worker = UploadWorker::spawn(
            "test",
            storage.clone(),
            ContextProvider::new(Context::default()).unwrap(),
            client.clone(),
            Arc::new(LineRequestBuilder::new("https://intake.test/v1")),
            &preset,
            None,
            telemetry,
        );

        storage.set_ignore_file_age_for_read(true);
        worker.flush_synchronously().await;
        worker.cancel();

        assert_eq!(client.request_count(), 2);
        assert!(storage.next_batch().await.is_none());
    }
}
