//! The feature registry and user-facing core operations.

use crate::bus::{Message, MessageBus, MessageReceiver, Telemetry};
use crate::config::{PerformanceOverride, PerformancePreset};
use crate::context::ContextProvider;
use crate::error::CoreError;
use crate::http::{HttpClient, ReqwestClient, RequestBuilder};
use crate::lane::{QuiescenceBarrier, SerialLane};
use crate::platform::{
    BackgroundTaskCoordinator, DateProvider, PlatformSources, SystemDateProvider,
};
use crate::storage::{DataEncryption, EventWriter, Storage};
use crate::types::{
    AppState, AppStateHistory, Context, DeviceInfo, TrackingConsent, UserInfo,
};
use crate::upload::UploadWorker;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An independently registered event producer (Logs, RUM, Traces, ...).
///
/// The name is part of the declared contract so the registry can return the
/// instance through a type-tagged [`get`](Core::get) without reflection.
/// Features returning a [`RequestBuilder`] opt into remote upload and receive
/// a storage and upload pipeline; features returning `None` are local only.
pub trait Feature: Send + Sync + 'static {
    /// Unique feature identifier, also the name of its directory on disk.
    const NAME: &'static str;

    fn message_receiver(&self) -> Arc<dyn MessageReceiver>;

    /// Overrides merged over the SDK-wide performance preset.
    fn performance_override(&self) -> Option<PerformanceOverride> {
        None
    }

    /// Builder for intake requests; `None` makes this a local feature with
    /// no storage or upload.
    fn request_builder(&self) -> Option<Arc<dyn RequestBuilder>> {
        None
    }

    /// Barrier over the feature's own background queues, drained during
    /// harvest between the bus and the context lane.
    fn quiescence_barrier(&self) -> Option<QuiescenceBarrier> {
        None
    }
}

struct FeatureRecord {
    instance: Arc<dyn Any + Send + Sync>,
    storage: Option<Arc<Storage>>,
    upload: Option<UploadWorker>,
    continuation: Option<QuiescenceBarrier>,
}

pub(crate) struct CoreInner {
    directory: PathBuf,
    context: ContextProvider,
    bus: MessageBus,
    /// One lane shared by every feature's storage; all file mutation
    /// serializes through it.
    rw_lane: SerialLane<()>,
    features: RwLock<HashMap<&'static str, FeatureRecord>>,
    consent: Mutex<TrackingConsent>,
    preset: PerformancePreset,
    encryption: Option<Arc<dyn DataEncryption>>,
    http_client: Arc<dyn HttpClient>,
    date: Arc<dyn DateProvider>,
    background: Option<Arc<dyn BackgroundTaskCoordinator>>,
    torn_down: AtomicBool,
}

/// The engine: feature registry, shared context, message bus and the
/// storage and upload pipelines of every registered feature.
///
/// Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// Start configuring a core rooted at `directory`.
    pub fn builder(directory: impl Into<PathBuf>) -> CoreBuilder {
        CoreBuilder::new(directory.into())
    }

    pub(crate) fn from_inner(inner: Arc<CoreInner>) -> Self {
        Self { inner }
    }

    /// Register a feature.
    ///
    /// Creates the feature's directory, derives its effective performance
    /// preset, instantiates storage and upload when the feature opts into
    /// remote upload, connects its message receiver and clears unauthorized
    /// data left over from a previous run.
    ///
    /// Must be called within a tokio runtime; the upload loop is spawned on
    /// it. Registering an already registered name fails fast.
    pub fn register<F: Feature>(&self, feature: F) -> Result<(), CoreError> {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return Err(CoreError::ShutDown);
        }
        let name = F::NAME;
        let receiver = feature.message_receiver();
        let effective = feature
            .performance_override()
            .map(|overrides| overrides.apply(&self.inner.preset))
            .unwrap_or_else(|| self.inner.preset.clone());
        let request_builder = feature.request_builder();
        let continuation = feature.quiescence_barrier();

        let mut features = self.inner.features.write();
        if features.contains_key(name) {
            return Err(CoreError::ConfigConflict { name });
        }

        let feature_dir = self.inner.directory.join(name).join("v2");
        fs::create_dir_all(&feature_dir)?;

        let (storage, upload) = match request_builder {
            Some(request_builder) => {
                let telemetry = Telemetry::new(self.inner.bus.clone(), name);
                let storage = Arc::new(Storage::new(
                    name,
                    &feature_dir,
                    effective.clone(),
                    self.inner.encryption.clone(),
                    self.inner.date.clone(),
                    telemetry.clone(),
                    self.inner.rw_lane.clone(),
                )?);
                storage.clear_unauthorized_data();
                let upload = UploadWorker::spawn(
                    name,
                    storage.clone(),
                    self.inner.context.clone(),
                    self.inner.http_client.clone(),
                    request_builder,
                    &effective,
                    self.inner.background.clone(),
                    telemetry,
                );
                (Some(storage), Some(upload))
            }
            None => (None, None),
        };

        features.insert(
            name,
            FeatureRecord {
                instance: Arc::new(feature),
                storage,
                upload,
                continuation,
            },
        );
        drop(features);

        self.inner.bus.connect(name, receiver);
        tracing::debug!(feature = name, "registered");
        Ok(())
    }

    /// The registered instance of `F`, if any.
    pub fn get<F: Feature>(&self) -> Option<Arc<F>> {
        let features = self.inner.features.read();
        let record = features.get(F::NAME)?;
        record.instance.clone().downcast::<F>().ok()
    }

    /// The write scope of a remote feature, or `None` when the feature is
    /// not registered or has no storage.
    pub fn scope(&self, name: &str) -> Option<FeatureScope> {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return None;
        }
        let features = self.inner.features.read();
        let record = features.get(name)?;
        let storage = record.storage.clone()?;
        Some(FeatureScope {
            context: self.inner.context.clone(),
            storage,
            telemetry: Telemetry::new(self.inner.bus.clone(), name),
        })
    }

    /// Replace the user identity in the context.
    pub fn set_user_info(&self, user: UserInfo) {
        self.inner.context.write(move |context| {
            context.user = Some(user);
        });
    }

    /// Merge attributes into the current user identity.
    pub fn add_user_extra_info(&self, extra: HashMap<String, Value>) {
        self.inner.context.write(move |context| {
            context.user.get_or_insert_with(UserInfo::default).extra.extend(extra);
        });
    }

    /// Change tracking consent. When the value actually changes, data written
    /// under `Pending` is migrated on every feature's storage before the new
    /// consent is published to the context.
    pub fn set_tracking_consent(&self, consent: TrackingConsent) {
        let mut current = self.inner.consent.lock();
        if *current == consent {
            return;
        }
        *current = consent;
        // Migrations are posted while the consent lock is held so that two
        // rapid changes cannot interleave their migration jobs.
        let features = self.inner.features.read();
        for record in features.values() {
            if let Some(storage) = &record.storage {
                storage.migrate_unauthorized(consent);
            }
        }
        drop(features);
        drop(current);
        self.inner.context.write(move |context| {
            context.tracking_consent = consent;
        });
    }

    /// Attach an opaque sub-context under `key`; `None` removes it.
    pub fn set_baggage(&self, key: impl Into<String>, value: Option<Value>) {
        let key = key.into();
        self.inner.context.write(move |context| match value {
            Some(value) => {
                context.baggages.insert(key, value);
            }
            None => {
                context.baggages.remove(&key);
            }
        });
    }

    /// Send a message on the bus; `fallback` runs when no receiver handles it.
    pub fn send_message(&self, message: Message, fallback: impl FnOnce() + Send + 'static) {
        self.inner.bus.send(message, fallback);
    }

    /// Remove all persisted batches of every feature.
    pub fn clear_all_data(&self) {
        let features = self.inner.features.read();
        for record in features.values() {
            if let Some(storage) = &record.storage {
                storage.clear_all_data();
            }
        }
    }

    /// Drain all internal queues in causal order, upload whatever is on disk
    /// and release every feature.
    ///
    /// The harvest staircase awaits the bus, each feature's own background
    /// work, the context lane and the read/write lane, in that order; every
    /// path from a user thread to disk passes through these queues in this
    /// order, so awaiting them in sequence observes quiescence. The drain
    /// then ignores minimum file ages and deletes each batch regardless of
    /// the response.
    ///
    /// No timeout; call from a thread that may block for a while.
    pub async fn flush_and_tear_down(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let (names, continuations, storages, uploads) = {
            let features = self.inner.features.read();
            (
                features.keys().copied().collect::<Vec<_>>(),
                features
                    .values()
                    .filter_map(|record| record.continuation.clone())
                    .collect::<Vec<_>>(),
                features
                    .values()
                    .filter_map(|record| record.storage.clone())
                    .collect::<Vec<_>>(),
                features
                    .values()
                    .filter_map(|record| record.upload.clone())
                    .collect::<Vec<_>>(),
            )
        };

        QuiescenceBarrier::sequence(vec![
            self.inner.bus.barrier(),
            QuiescenceBarrier::group(continuations),
            self.inner.context.barrier(),
            self.inner.rw_lane.barrier(),
        ])
        .wait()
        .await;

        for storage in &storages {
            storage.set_ignore_file_age_for_read(true);
        }
        for upload in &uploads {
            upload.flush_synchronously().await;
        }
        for storage in &storages {
            storage.set_ignore_file_age_for_read(false);
        }
        for upload in &uploads {
            upload.cancel();
        }
        for name in names {
            self.inner.bus.disconnect(name);
        }
        self.inner.features.write().clear();
        tracing::debug!("core torn down");
    }

    #[cfg(test)]
    pub(crate) fn upload_delay_for(&self, name: &str) -> Option<std::time::Duration> {
        let features = self.inner.features.read();
        features
            .get(name)
            .and_then(|record| record.upload.as_ref())
            .map(UploadWorker::current_delay)
    }
}

/// Options for one [`FeatureScope::event_write_context_with`] call.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventWriteOptions {
    /// Write under `Granted` regardless of the current consent.
    pub bypass_consent: bool,
    /// Close the current batch before the first write.
    pub force_new_batch: bool,
}

/// The contract under which a feature receives a consistent context and a
/// writer bound to the current consent.
pub struct FeatureScope {
    context: ContextProvider,
    storage: Arc<Storage>,
    telemetry: Telemetry,
}

impl FeatureScope {
    /// Schedule `block` with the current context and a writer selected by the
    /// current consent.
    pub fn event_write_context(
        &self,
        block: impl FnOnce(&Context, &EventWriter) + Send + 'static,
    ) {
        self.event_write_context_with(EventWriteOptions::default(), block);
    }

    /// Like [`event_write_context`](Self::event_write_context) with explicit
    /// options. A panicking block is caught and reported through telemetry;
    /// events already written by it stay in the batch.
    pub fn event_write_context_with(
        &self,
        options: EventWriteOptions,
        block: impl FnOnce(&Context, &EventWriter) + Send + 'static,
    ) {
        let storage = self.storage.clone();
        let telemetry = self.telemetry.clone();
        self.context.read(move |context| {
            let consent = if options.bypass_consent {
                TrackingConsent::Granted
            } else {
                context.tracking_consent
            };
            let writer = storage.writer(consent, options.force_new_batch);
            if catch_unwind(AssertUnwindSafe(|| block(context, &writer))).is_err() {
                telemetry.error("event write block panicked; batch preserved");
            }
        });
    }
}

/// Configuration for a [`Core`], following the builder convention.
#[must_use = "builders do nothing unless you call .build()"]
pub struct CoreBuilder {
    directory: PathBuf,
    site: String,
    client_token: String,
    service: String,
    env: String,
    version: String,
    source: String,
    sdk_version: String,
    device: DeviceInfo,
    tracking_consent: TrackingConsent,
    preset: PerformancePreset,
    encryption: Option<Arc<dyn DataEncryption>>,
    http_client: Option<Arc<dyn HttpClient>>,
    date_provider: Option<Arc<dyn DateProvider>>,
    background_tasks_enabled: bool,
    background_coordinator: Option<Arc<dyn BackgroundTaskCoordinator>>,
    sources: PlatformSources,
}

impl CoreBuilder {
    fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            site: String::new(),
            client_token: String::new(),
            service: String::new(),
            env: String::new(),
            version: String::new(),
            source: "relaykit".to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            device: DeviceInfo::default(),
            tracking_consent: TrackingConsent::Pending,
            preset: PerformancePreset::default(),
            encryption: None,
            http_client: None,
            date_provider: None,
            background_tasks_enabled: false,
            background_coordinator: None,
            sources: PlatformSources::default(),
        }
    }

    pub fn site(mut self, site: impl Into<String>) -> Self {
        self.site = site.into();
        self
    }

    pub fn client_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = token.into();
        self
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn device(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    /// Initial tracking consent; defaults to `Pending`.
    pub fn tracking_consent(mut self, consent: TrackingConsent) -> Self {
        self.tracking_consent = consent;
        self
    }

    /// SDK-wide performance preset, the default for every feature.
    pub fn performance(mut self, preset: PerformancePreset) -> Self {
        self.preset = preset;
        self
    }

    /// Encrypt event payloads at rest.
    pub fn encryption(mut self, encryption: Arc<dyn DataEncryption>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Replace the default reqwest transport.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn date_provider(mut self, provider: Arc<dyn DateProvider>) -> Self {
        self.date_provider = Some(provider);
        self
    }

    /// Hold OS background-task leases around in-flight upload requests.
    pub fn background_tasks(mut self, enabled: bool) -> Self {
        self.background_tasks_enabled = enabled;
        self
    }

    pub fn background_coordinator(
        mut self,
        coordinator: Arc<dyn BackgroundTaskCoordinator>,
    ) -> Self {
        self.background_coordinator = Some(coordinator);
        self
    }

    /// Wire optional platform sources into the context.
    pub fn platform_sources(mut self, sources: PlatformSources) -> Self {
        self.sources = sources;
        self
    }

    /// Create the root directory, spawn the lanes and publish the initial
    /// context snapshot.
    pub fn build(self) -> Result<Core, CoreError> {
        fs::create_dir_all(&self.directory)?;
        let date: Arc<dyn DateProvider> = self
            .date_provider
            .unwrap_or_else(|| Arc::new(SystemDateProvider));
        let now = date.now();

        let initial = Context {
            site: self.site,
            client_token: self.client_token,
            service: self.service,
            env: self.env,
            version: self.version,
            sdk_version: self.sdk_version,
            source: self.source,
            device: self.device,
            app_state_history: AppStateHistory::new(AppState::Active, now),
            tracking_consent: self.tracking_consent,
            ..Context::default()
        };

        let context = ContextProvider::new(initial)?;
        let bus = MessageBus::new()?;
        let rw_lane = SerialLane::spawn("read-write", ())?;

        let background = self.background_tasks_enabled.then(|| {
            self.background_coordinator.unwrap_or_else(|| {
                Arc::new(crate::platform::NoopBackgroundTaskCoordinator)
            })
        });

        let inner = Arc::new(CoreInner {
            directory: self.directory,
            context: context.clone(),
            bus: bus.clone(),
            rw_lane,
            features: RwLock::new(HashMap::new()),
            consent: Mutex::new(self.tracking_consent),
            preset: self.preset,
            encryption: self.encryption,
            http_client: self
                .http_client
                .unwrap_or_else(|| Arc::new(ReqwestClient::new())),
            date: date.clone(),
            background,
            torn_down: AtomicBool::new(false),
        });
        inner.bus.connect_core(Arc::downgrade(&inner));

        let broadcast = bus.clone();
        context.set_change_hook(move |snapshot| {
            broadcast.send(Message::Context(snapshot.clone()), || {});
        });

        // Push sources merge into the context on its own lane.
        if let Some(reachability) = self.sources.reachability {
            context.subscribe(reachability, |context, value| {
                context.network_reachability = value;
            });
        }
        if let Some(carrier) = self.sources.carrier {
            context.subscribe(carrier, |context, value| {
                context.carrier = Some(value);
            });
        }
        if let Some(battery) = self.sources.battery {
            context.subscribe(battery, |context, value| {
                context.battery = Some(value);
            });
        }
        if let Some(low_power) = self.sources.low_power_mode {
            context.subscribe(low_power, |context, value| {
                context.low_power_mode = value;
            });
        }
        if let Some(app_state) = self.sources.app_state {
            let clock = date.clone();
            context.subscribe(app_state, move |context, value| {
                context.app_state_history.append(value, clock.now());
            });
        }
        if let Some(server_date) = self.sources.server_date {
            let provider = context.clone();
            server_date.synchronize(Box::new(move |offset| {
                provider.write(move |context| context.server_time_offset_ms = offset);
            }));
        }
        // Launch time is a pull source, re-evaluated lazily on each read.
        if let Some(reader) = self.sources.launch_time {
            context.assign(move |context| context.launch_time = reader.launch_time());
        }

        // Publish the initial snapshot so receivers connecting later get it.
        context.write(|_| {});

        Ok(Core::from_inner(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{eventually, LineRequestBuilder, MockHttpClient, TestClock};
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    struct RecordingReceiver {
        log: Mutex<Vec<String>>,
    }

    impl RecordingReceiver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
            })
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl MessageReceiver for RecordingReceiver {
        fn receive(&self, message: &Message, _core: &Core) -> bool {
            let entry = match message {
                Message::Context(context) => {
                    if context.baggages.contains_key("ping") {
                        format!("context:{}:ping", context.snapshot_version)
                    } else {
                        format!("context:{}", context.snapshot_version)
                    }
                }
                Message::Payload { key, .. } => format!("payload:{key}"),
                Message::Telemetry(_) => "telemetry".to_string(),
            };
            self.log.lock().push(entry);
            true
        }
    }

    struct LogsFeature {
        receiver: Arc<RecordingReceiver>,
    }

    impl Feature for LogsFeature {
        const NAME: &'static str = "logs";

        fn message_receiver(&self) -> Arc<dyn MessageReceiver> {
            self.receiver.clone()
        }

        fn request_builder(&self) -> Option<Arc<dyn RequestBuilder>> {
            Some(Arc::new(LineRequestBuilder::new("https://intake.test/logs")))
        }
    }

    fn test_preset() -> PerformancePreset {
        PerformancePreset {
            max_file_size: 16 * 1024,
            max_object_size: 1024,
            max_objects_in_file: 100,
            max_file_age_for_write: Duration::from_secs(60),
            min_file_age_for_read: Duration::from_millis(50),
            max_file_age_for_read: Duration::from_secs(3600),
            max_directory_size: 1 << 20,
            initial_upload_delay: Duration::from_millis(10),
            min_upload_delay: Duration::from_millis(10),
            max_upload_delay: Duration::from_millis(40),
            upload_delay_change_rate: 0.5,
            low_power_override: false,
        }
    }

    struct Harness {
        core: Core,
        clock: Arc<TestClock>,
        client: Arc<MockHttpClient>,
        receiver: Arc<RecordingReceiver>,
        root: TempDir,
    }

    impl Harness {
        fn consent_dir(&self, consent: TrackingConsent) -> PathBuf {
            self.root
                .path()
                .join("logs/v2")
                .join(consent.directory())
        }
    }

    fn harness(consent: TrackingConsent, statuses: Vec<u16>) -> Harness {
        harness_with(consent, statuses, test_preset())
    }

    fn harness_with(
        consent: TrackingConsent,
        statuses: Vec<u16>,
        preset: PerformancePreset,
    ) -> Harness {
        let root = TempDir::new().unwrap();
        let clock = Arc::new(TestClock::default());
        let client = Arc::new(MockHttpClient::with_statuses(statuses));
        let core = Core::builder(root.path())
            .service("harness")
            .env("test")
            .tracking_consent(consent)
            .performance(preset)
            .http_client(client.clone())
            .date_provider(clock.clone())
            .build()
            .unwrap();
        let receiver = RecordingReceiver::new();
        core.register(LogsFeature {
            receiver: receiver.clone(),
        })
        .unwrap();
        Harness {
            core,
            clock,
            client,
            receiver,
            root,
        }
    }

    fn write_event(core: &Core, payload: &'static str) {
        let scope = core.scope("logs").expect("logs feature is registered");
        scope.event_write_context(move |_context, writer| writer.write(payload));
    }

    fn file_count(dir: &Path) -> usize {
        fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    fn dir_bytes(dir: &Path) -> u64 {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|entry| entry.metadata().ok())
                    .map(|metadata| metadata.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn granted_events_upload_in_order_and_disk_drains() {
        let h = harness(TrackingConsent::Granted, vec![202]);
        for payload in ["a", "b", "c"] {
            write_event(&h.core, payload);
        }
        let granted = h.consent_dir(TrackingConsent::Granted);
        eventually("three events persisted", || dir_bytes(&granted) == 15).await;

        h.clock.advance(Duration::from_millis(60));
        eventually("batch uploaded", || h.client.request_count() == 1).await;
        eventually("granted directory empty", || file_count(&granted) == 0).await;

        assert_eq!(h.client.request_bodies()[0].as_ref(), b"a\nb\nc");
    }

    #[tokio::test]
    async fn consent_withdrawal_deletes_pending_without_upload() {
        let h = harness(TrackingConsent::Pending, vec![200]);
        write_event(&h.core, "x");
        let pending = h.consent_dir(TrackingConsent::Pending);
        eventually("event persisted under pending", || dir_bytes(&pending) == 5).await;

        h.core.set_tracking_consent(TrackingConsent::NotGranted);
        eventually("pending wiped", || file_count(&pending) == 0).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.client.request_count(), 0);
    }

    #[tokio::test]
    async fn consent_grant_migrates_pending_and_uploads() {
        let h = harness(TrackingConsent::Pending, vec![200]);
        write_event(&h.core, "y");
        let pending = h.consent_dir(TrackingConsent::Pending);
        eventually("event persisted under pending", || dir_bytes(&pending) == 5).await;

        h.core.set_tracking_consent(TrackingConsent::Granted);
        let granted = h.consent_dir(TrackingConsent::Granted);
        eventually("batch migrated", || file_count(&granted) == 1).await;

        h.clock.advance(Duration::from_millis(60));
        eventually("migrated batch uploaded", || h.client.request_count() == 1).await;
        eventually("granted directory empty", || file_count(&granted) == 0).await;
        assert_eq!(h.client.request_bodies()[0].as_ref(), b"y");
    }

    #[tokio::test]
    async fn retryable_failure_keeps_batch_and_backs_off() {
        // Slow cadence: the first tick fires well after the batch became
        // eligible, and the post-failure delay leaves a wide window to
        // observe the retained batch.
        let preset = PerformancePreset {
            initial_upload_delay: Duration::from_millis(200),
            min_upload_delay: Duration::from_millis(10),
            max_upload_delay: Duration::from_millis(400),
            upload_delay_change_rate: 0.5,
            ..test_preset()
        };
        let h = harness_with(TrackingConsent::Granted, vec![503, 200], preset);
        write_event(&h.core, "z");
        let granted = h.consent_dir(TrackingConsent::Granted);
        eventually("event persisted", || dir_bytes(&granted) == 5).await;
        h.clock.advance(Duration::from_millis(60));

        eventually("first attempt made", || h.client.request_count() >= 1).await;
        assert_eq!(file_count(&granted), 1, "batch must survive the 503");
        eventually("delay backed off", || {
            h.core.upload_delay_for("logs").unwrap() > Duration::from_millis(250)
        })
        .await;

        eventually("retry succeeds and disk drains", || {
            h.client.request_count() >= 2 && file_count(&granted) == 0
        })
        .await;
        eventually("delay shrank after the success", || {
            h.core.upload_delay_for("logs").unwrap() < Duration::from_millis(250)
        })
        .await;
    }

    #[tokio::test]
    async fn tear_down_lands_in_flight_writes_and_drains_disk() {
        let h = harness(TrackingConsent::Granted, vec![200]);
        write_event(&h.core, "e1");
        write_event(&h.core, "e2");
        h.core.flush_and_tear_down().await;

        assert_eq!(file_count(&h.consent_dir(TrackingConsent::Granted)), 0);
        let uploaded: Vec<u8> = h
            .client
            .request_bodies()
            .iter()
            .flat_map(|body| body.to_vec())
            .collect();
        assert!(uploaded.windows(2).any(|w| w == b"e1"));
        assert!(uploaded.windows(2).any(|w| w == b"e2"));
    }

    struct ChainReceiver {
        fired: AtomicBool,
    }

    impl MessageReceiver for ChainReceiver {
        fn receive(&self, message: &Message, core: &Core) -> bool {
            if let Message::Context(context) = message {
                if context.baggages.contains_key("ping")
                    && !self.fired.swap(true, Ordering::SeqCst)
                {
                    core.send_message(
                        Message::Payload {
                            key: "from-a".to_string(),
                            value: json!({"seen": true}),
                        },
                        || {},
                    );
                }
            }
            true
        }
    }

    struct FeatureA;

    impl Feature for FeatureA {
        const NAME: &'static str = "feature-a";

        fn message_receiver(&self) -> Arc<dyn MessageReceiver> {
            Arc::new(ChainReceiver {
                fired: AtomicBool::new(false),
            })
        }
    }

    struct FeatureB {
        receiver: Arc<RecordingReceiver>,
    }

    impl Feature for FeatureB {
        const NAME: &'static str = "feature-b";

        fn message_receiver(&self) -> Arc<dyn MessageReceiver> {
            self.receiver.clone()
        }
    }

    #[tokio::test]
    async fn bus_messages_fan_out_in_causal_order() {
        let root = TempDir::new().unwrap();
        let core = Core::builder(root.path()).build().unwrap();
        let receiver_b = RecordingReceiver::new();
        core.register(FeatureA).unwrap();
        core.register(FeatureB {
            receiver: receiver_b.clone(),
        })
        .unwrap();

        // Feature A reacts to the baggage update by sending a payload; B must
        // observe the context update first, then the payload.
        core.set_baggage("ping", Some(json!(true)));
        eventually("payload relayed to feature B", || {
            receiver_b.entries().iter().any(|e| e == "payload:from-a")
        })
        .await;

        let entries = receiver_b.entries();
        let context_at = entries
            .iter()
            .position(|e| e.starts_with("context:") && e.ends_with(":ping"))
            .expect("B observed the baggage context update");
        let payload_at = entries
            .iter()
            .position(|e| e == "payload:from-a")
            .unwrap();
        assert!(context_at < payload_at);
    }

    #[tokio::test]
    async fn receiver_gets_current_context_on_connect() {
        let h = harness(TrackingConsent::Granted, vec![200]);
        eventually("context delivered on connect", || {
            h.receiver
                .entries()
                .first()
                .is_some_and(|e| e.starts_with("context:"))
        })
        .await;
    }

    #[tokio::test]
    async fn unhandled_message_invokes_fallback() {
        let root = TempDir::new().unwrap();
        let core = Core::builder(root.path()).build().unwrap();
        let fell_back = Arc::new(AtomicBool::new(false));

        let flag = fell_back.clone();
        core.send_message(
            Message::Payload {
                key: "nobody-home".to_string(),
                value: json!(null),
            },
            move || flag.store(true, Ordering::SeqCst),
        );
        eventually("fallback invoked", || fell_back.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn duplicate_registration_fails_fast() {
        let h = harness(TrackingConsent::Granted, vec![200]);
        let result = h.core.register(LogsFeature {
            receiver: RecordingReceiver::new(),
        });
        assert!(matches!(
            result,
            Err(CoreError::ConfigConflict { name: "logs" })
        ));
    }

    #[tokio::test]
    async fn registry_returns_typed_instances_and_scopes() {
        let h = harness(TrackingConsent::Granted, vec![200]);
        h.core.register(FeatureA).unwrap();

        assert!(h.core.get::<LogsFeature>().is_some());
        assert!(h.core.get::<FeatureB>().is_none());
        assert!(h.core.scope("logs").is_some());
        // Local features have no storage, hence no write scope.
        assert!(h.core.scope("feature-a").is_none());
        assert!(h.core.scope("unknown").is_none());
    }

    #[tokio::test]
    async fn operations_after_tear_down_are_rejected() {
        let h = harness(TrackingConsent::Granted, vec![200]);
        h.core.flush_and_tear_down().await;

        assert!(h.core.scope("logs").is_none());
        assert!(matches!(
            h.core.register(FeatureA),
            Err(CoreError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn panicking_write_block_is_contained() {
        let h = harness(TrackingConsent::Granted, vec![200]);
        let scope = h.core.scope("logs").unwrap();
        scope.event_write_context(|_context, writer| {
            writer.write("ok1");
            panic!("exercise the telemetry path");
        });
        write_event(&h.core, "ok2");

        let granted = h.consent_dir(TrackingConsent::Granted);
        eventually("both events persisted", || dir_bytes(&granted) == 14).await;

        h.clock.advance(Duration::from_millis(60));
        eventually("batch uploaded", || h.client.request_count() == 1).await;
        assert_eq!(h.client.request_bodies()[0].as_ref(), b"ok1\nok2");
    }

    #[tokio::test]
    async fn bypassing_consent_writes_to_granted() {
        let h = harness(TrackingConsent::Pending, vec![200]);
        let scope = h.core.scope("logs").unwrap();
        scope.event_write_context_with(
            EventWriteOptions {
                bypass_consent: true,
                force_new_batch: false,
            },
            |_context, writer| writer.write("b"),
        );

        let granted = h.consent_dir(TrackingConsent::Granted);
        eventually("event persisted under granted", || dir_bytes(&granted) == 5).await;
        assert_eq!(file_count(&h.consent_dir(TrackingConsent::Pending)), 0);
    }

    #[tokio::test]
    async fn clear_all_data_removes_unsent_batches() {
        let h = harness(TrackingConsent::Granted, vec![200]);
        write_event(&h.core, "q");
        let granted = h.consent_dir(TrackingConsent::Granted);
        eventually("event persisted", || file_count(&granted) == 1).await;

        h.core.clear_all_data();
        eventually("granted wiped", || file_count(&granted) == 0).await;
        assert_eq!(h.client.request_count(), 0);
    }

    struct FixedLaunchTime;

    impl crate::platform::LaunchTimeReader for FixedLaunchTime {
        fn launch_time(&self) -> Option<crate::types::LaunchTime> {
            Some(crate::types::LaunchTime {
                launch_date: std::time::SystemTime::UNIX_EPOCH,
                time_to_initialize: Duration::from_millis(250),
            })
        }
    }

    #[tokio::test]
    async fn platform_sources_feed_the_context() {
        use crate::testutil::ManualPublisher;
        use crate::types::NetworkReachability;

        let root = TempDir::new().unwrap();
        let (reachability, reachability_handle) =
            ManualPublisher::<NetworkReachability>::new();
        let core = Core::builder(root.path())
            .platform_sources(PlatformSources {
                reachability: Some(Box::new(reachability)),
                launch_time: Some(Box::new(FixedLaunchTime)),
                ..PlatformSources::default()
            })
            .build()
            .unwrap();
        core.register(LogsFeature {
            receiver: RecordingReceiver::new(),
        })
        .unwrap();

        reachability_handle.emit(NetworkReachability::No);

        let (tx, rx) = std::sync::mpsc::channel();
        let scope = core.scope("logs").unwrap();
        scope.event_write_context(move |context, _writer| {
            let _ = tx.send((context.network_reachability, context.launch_time));
        });

        let (reachability, launch_time) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reachability, NetworkReachability::No);
        assert_eq!(
            launch_time.expect("pull source evaluated on read").time_to_initialize,
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn user_info_updates_are_visible_to_write_scopes() {
        let h = harness(TrackingConsent::Granted, vec![200]);
        h.core.set_user_info(UserInfo {
            id: Some("user-1".to_string()),
            ..UserInfo::default()
        });
        h.core
            .add_user_extra_info(HashMap::from([("plan".to_string(), json!("pro"))]));

        let (tx, rx) = std::sync::mpsc::channel();
        let scope = h.core.scope("logs").unwrap();
        scope.event_write_context(move |context, _writer| {
            let _ = tx.send(context.user.clone());
        });

        let user = rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("user info was set before the read");
        assert_eq!(user.id.as_deref(), Some("user-1"));
        assert_eq!(user.extra.get("plan"), Some(&json!("pro")));
    }
}
