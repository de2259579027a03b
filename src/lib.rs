//! relaykit
//!
//! A crash-tolerant, consent-aware batching and upload engine: the core of a
//! telemetry SDK. Independent product features write events through a shared
//! context; events are buffered to disk in consent-partitioned batch files
//! and uploaded asynchronously with adaptive backoff, surviving offline
//! periods, app suspension and killed processes.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use relaykit::{
//!     Core, Feature, HttpRequest, Message, MessageReceiver, RequestBuilder,
//!     TrackingConsent,
//! };
//! use std::sync::Arc;
//!
//! struct LogsReceiver;
//!
//! impl MessageReceiver for LogsReceiver {
//!     fn receive(&self, _message: &Message, _core: &Core) -> bool {
//!         false
//!     }
//! }
//!
//! struct LogsRequestBuilder;
//!
//! impl RequestBuilder for LogsRequestBuilder {
//!     fn build(
//!         &self,
//!         events: &[bytes::Bytes],
//!         context: &relaykit::Context,
//!     ) -> Result<HttpRequest, relaykit::BoxError> {
//!         let body = events.join(&b'\n');
//!         Ok(HttpRequest::post(format!("https://intake.example.com/logs/{}", context.env))
//!             .header("content-type", "application/x-ndjson")
//!             .body(body))
//!     }
//! }
//!
//! struct LogsFeature;
//!
//! impl Feature for LogsFeature {
//!     const NAME: &'static str = "logs";
//!
//!     fn message_receiver(&self) -> Arc<dyn MessageReceiver> {
//!         Arc::new(LogsReceiver)
//!     }
//!
//!     fn request_builder(&self) -> Option<Arc<dyn RequestBuilder>> {
//!         Some(Arc::new(LogsRequestBuilder))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let core = Core::builder("/var/tmp/telemetry")
//!         .service("shopist")
//!         .env("prod")
//!         .version("1.2.3")
//!         .tracking_consent(TrackingConsent::Granted)
//!         .build()?;
//!
//!     core.register(LogsFeature)?;
//!
//!     let scope = core.scope("logs").expect("registered above");
//!     scope.event_write_context(|_context, writer| {
//!         writer.write(&br#"{"message":"checkout started"}"#[..]);
//!     });
//!
//!     core.flush_and_tear_down().await;
//!     Ok(())
//! }
//! ```

mod batch;
mod bus;
mod config;
mod context;
mod core;
mod error;
mod http;
mod lane;
mod platform;
mod storage;
mod types;
mod upload;

pub use bus::{Message, MessageReceiver, TelemetryKind, TelemetryMessage};
pub use config::{PerformanceOverride, PerformancePreset};
pub use crate::core::{Core, CoreBuilder, EventWriteOptions, Feature, FeatureScope};
pub use crate::http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient, RequestBuilder};
pub use error::{BoxError, CoreError, TransportError};
pub use lane::QuiescenceBarrier;
pub use platform::{
    BackgroundTaskCoordinator, DateProvider, LaunchTimeReader, NoopBackgroundTaskCoordinator,
    Observer, PlatformSources, Publisher, ServerDateProvider, SystemDateProvider,
};
pub use storage::{DataEncryption, EventWriter};
pub use types::{
    AppState, AppStateHistory, BatteryState, BatteryStatus, CarrierInfo, Context, DeviceInfo,
    LaunchTime, NetworkReachability, TrackingConsent, UserInfo,
};
