//! Platform adapter seams: clock, push sources, background-task leases.
//!
//! All sources are optional. On platforms that cannot provide one, the
//! corresponding context field keeps its default and the engine still works.

use crate::types::{
    AppState, BatteryStatus, CarrierInfo, LaunchTime, NetworkReachability,
};
use std::time::SystemTime;

/// Wall-clock source. Monotonic within a process run, but may jump on
/// wall-clock corrections.
pub trait DateProvider: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

/// Default provider backed by the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDateProvider;

impl DateProvider for SystemDateProvider {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Callback handed to a [`Publisher`]; invoked once per emitted value.
pub type Observer<T> = Box<dyn Fn(T) + Send + Sync>;

/// A push source of context field values.
///
/// `subscribe` consumes the publisher so it can move itself into whatever
/// thread, queue or OS callback delivers its values.
pub trait Publisher: Send + 'static {
    type Value: Send + 'static;

    fn subscribe(self: Box<Self>, observer: Observer<Self::Value>);
}

/// Push source for the server-time offset, in milliseconds.
pub trait ServerDateProvider: Send + 'static {
    fn synchronize(self: Box<Self>, on_offset: Observer<i64>);
}

/// One-shot reader of the process launch measurement.
pub trait LaunchTimeReader: Send + Sync + 'static {
    fn launch_time(&self) -> Option<LaunchTime>;
}

/// OS background-task lease, acquired around in-flight upload requests when
/// background tasks are enabled. `end_task` is called on completion; an
/// implementation handling expiration warnings may release earlier on its own.
pub trait BackgroundTaskCoordinator: Send + Sync + 'static {
    fn begin_task(&self);
    fn end_task(&self);
}

/// Coordinator for platforms without background-task leases.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopBackgroundTaskCoordinator;

impl BackgroundTaskCoordinator for NoopBackgroundTaskCoordinator {
    fn begin_task(&self) {}
    fn end_task(&self) {}
}

/// Optional platform sources wired into the context at build time.
#[derive(Default)]
pub struct PlatformSources {
    pub reachability: Option<Box<dyn Publisher<Value = NetworkReachability>>>,
    pub carrier: Option<Box<dyn Publisher<Value = CarrierInfo>>>,
    pub battery: Option<Box<dyn Publisher<Value = BatteryStatus>>>,
    pub low_power_mode: Option<Box<dyn Publisher<Value = bool>>>,
    pub app_state: Option<Box<dyn Publisher<Value = AppState>>>,
    pub server_date: Option<Box<dyn ServerDateProvider>>,
    pub launch_time: Option<Box<dyn LaunchTimeReader>>,
}

impl std::fmt::Debug for PlatformSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformSources")
            .field("reachability", &self.reachability.is_some())
            .field("carrier", &self.carrier.is_some())
            .field("battery", &self.battery.is_some())
            .field("low_power_mode", &self.low_power_mode.is_some())
            .field("app_state", &self.app_state.is_some())
            .field("server_date", &self.server_date.is_some())
            .field("launch_time", &self.launch_time.is_some())
            .finish()
    }
}
