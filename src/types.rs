//! Context snapshot and its component types.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

/// User decision about collecting and sending telemetry data.
///
/// The consent value selects the directory new batches are written to:
/// - `Granted`: batches are eligible for upload
/// - `Pending`: batches are held back until the user decides
/// - `NotGranted`: events are dropped at the writer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingConsent {
    /// The user granted consent; data is persisted and uploaded.
    Granted,
    /// The user denied consent; new events are dropped.
    NotGranted,
    /// No decision yet; data is persisted but not uploaded.
    #[default]
    Pending,
}

impl TrackingConsent {
    /// Name of the consent partition directory for this value.
    pub(crate) fn directory(self) -> &'static str {
        match self {
            TrackingConsent::Granted => "granted",
            TrackingConsent::Pending => "pending",
            TrackingConsent::NotGranted => "unauthorized",
        }
    }
}

impl fmt::Display for TrackingConsent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directory())
    }
}

/// Network reachability as reported by the platform monitor.
///
/// `Maybe` is the launch-time value on platforms where the first reachability
/// callback has not fired yet; uploads are attempted in that state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkReachability {
    /// The network is reachable.
    Yes,
    /// The network is not reachable.
    No,
    /// Reachability is not determined yet.
    #[default]
    Maybe,
}

/// Cellular carrier details, when available.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CarrierInfo {
    pub name: Option<String>,
    pub technology: Option<String>,
}

/// Battery charging state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryState {
    #[default]
    Unknown,
    Unplugged,
    Charging,
    Full,
}

/// Battery snapshot from the platform publisher.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BatteryStatus {
    pub state: BatteryState,
    /// Charge level in `0.0..=1.0`.
    pub level: f32,
}

/// Application execution state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    /// The app is running in the foreground and receiving events.
    Active,
    /// The app is in the foreground but not receiving events.
    Inactive,
    /// The app is running in the background.
    Background,
}

impl AppState {
    /// Whether the app is in the foreground (active or inactive).
    pub fn is_running_in_foreground(self) -> bool {
        matches!(self, AppState::Active | AppState::Inactive)
    }
}

/// Timestamped history of application state transitions within this process.
#[derive(Clone, Debug)]
pub struct AppStateHistory {
    pub initial_state: AppState,
    pub initial_date: SystemTime,
    /// Transitions appended by the app-state publisher, oldest first.
    pub changes: Vec<(AppState, SystemTime)>,
}

impl AppStateHistory {
    pub fn new(state: AppState, date: SystemTime) -> Self {
        Self {
            initial_state: state,
            initial_date: date,
            changes: Vec::new(),
        }
    }

    /// Record a state transition.
    pub fn append(&mut self, state: AppState, date: SystemTime) {
        self.changes.push((state, date));
    }

    /// The most recent state.
    pub fn current_state(&self) -> AppState {
        self.changes
            .last()
            .map(|(state, _)| *state)
            .unwrap_or(self.initial_state)
    }
}

impl Default for AppStateHistory {
    fn default() -> Self {
        Self::new(AppState::Active, SystemTime::UNIX_EPOCH)
    }
}

/// Process launch measurement from the platform reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchTime {
    /// When the process was launched.
    pub launch_date: SystemTime,
    /// Time from process launch to SDK initialization.
    pub time_to_initialize: Duration,
}

/// Basic device identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub os_name: String,
    pub os_version: String,
}

/// Identity of the end user, attached to every event's context.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UserInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Free-form attributes merged by `add_user_extra_info`.
    pub extra: HashMap<String, Value>,
}

/// Snapshot of device, app, user and SDK state shared with every event.
///
/// A `Context` value is immutable once handed to a reader; mutations go
/// through the provider's serial queue and produce a new snapshot with a
/// higher `snapshot_version`. Individual fields are last-writer-wins.
#[derive(Clone, Debug, Default)]
pub struct Context {
    /// Intake site identifier, e.g. a region code.
    pub site: String,
    pub client_token: String,
    pub service: String,
    pub env: String,
    /// Host application version.
    pub version: String,
    pub sdk_version: String,
    /// Event source tag, e.g. `"ios"` or `"android"`.
    pub source: String,
    pub device: DeviceInfo,
    pub app_state_history: AppStateHistory,
    pub launch_time: Option<LaunchTime>,
    /// Difference between server time and device time, in milliseconds.
    pub server_time_offset_ms: i64,
    pub network_reachability: NetworkReachability,
    pub carrier: Option<CarrierInfo>,
    pub battery: Option<BatteryStatus>,
    pub low_power_mode: bool,
    pub user: Option<UserInfo>,
    pub tracking_consent: TrackingConsent,
    /// Opaque sub-contexts contributed by features, keyed by feature name.
    pub baggages: HashMap<String, Value>,
    /// Monotonic snapshot counter, bumped on every committed write.
    pub snapshot_version: u64,
}
