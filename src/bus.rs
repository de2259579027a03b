//! Typed message fan-out between features and the core.

use crate::core::{Core, CoreInner};
use crate::lane::{QuiescenceBarrier, SerialLane};
use crate::types::Context;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};

/// Severity of a self-monitoring message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TelemetryKind {
    Debug,
    Error,
}

/// Self-monitoring payload emitted by the engine. A telemetry-capable feature
/// may pick these up from the bus; otherwise they end in the log.
#[derive(Clone, Debug)]
pub struct TelemetryMessage {
    pub kind: TelemetryKind,
    pub message: String,
}

/// A message carried on the bus.
#[derive(Clone, Debug)]
pub enum Message {
    /// A new context snapshot. Re-delivered to receivers on connect.
    Context(Context),
    /// Feature-specific payload addressed by key.
    Payload { key: String, value: Value },
    /// Self-monitoring message.
    Telemetry(TelemetryMessage),
}

/// Receives messages from the bus.
///
/// Return `true` to acknowledge handling; when no receiver acknowledges a
/// message, the sender's fallback runs. Delivery is asynchronous and serial
/// per receiver; order from the same sender is preserved.
pub trait MessageReceiver: Send + Sync + 'static {
    fn receive(&self, message: &Message, core: &Core) -> bool;
}

struct BusState {
    receivers: HashMap<String, Arc<dyn MessageReceiver>>,
    /// Weak back-reference; the core owns the bus, not the other way around.
    core: Weak<CoreInner>,
    latest_context: Option<Context>,
}

/// Fan-out dispatcher with its own serial lane.
///
/// The bus does not persist undelivered messages: a receiver connecting after
/// a message was sent will not observe it, with the exception of the context,
/// which is re-delivered on connect.
#[derive(Clone)]
pub(crate) struct MessageBus {
    lane: SerialLane<BusState>,
}

impl MessageBus {
    pub fn new() -> io::Result<Self> {
        let lane = SerialLane::spawn(
            "bus",
            BusState {
                receivers: HashMap::new(),
                core: Weak::new(),
                latest_context: None,
            },
        )?;
        Ok(Self { lane })
    }

    /// Store the weak back-reference used to hand `&Core` to receivers.
    pub fn connect_core(&self, core: Weak<CoreInner>) {
        self.lane.post(move |state| state.core = core);
    }

    /// Register a receiver under `key`. The current context, if any, is
    /// delivered to it right away.
    pub fn connect(&self, key: impl Into<String>, receiver: Arc<dyn MessageReceiver>) {
        let key = key.into();
        self.lane.post(move |state| {
            if let (Some(context), Some(core)) =
                (&state.latest_context, state.core.upgrade())
            {
                let core = Core::from_inner(core);
                receiver.receive(&Message::Context(context.clone()), &core);
            }
            state.receivers.insert(key, receiver);
        });
    }

    pub fn disconnect(&self, key: &str) {
        let key = key.to_string();
        self.lane.post(move |state| {
            state.receivers.remove(&key);
        });
    }

    /// Deliver `message` to all receivers; when none acknowledges handling,
    /// `fallback` runs instead.
    pub fn send(&self, message: Message, fallback: impl FnOnce() + Send + 'static) {
        self.lane.post(move |state| {
            if let Message::Context(context) = &message {
                state.latest_context = Some(context.clone());
            }
            let Some(core) = state.core.upgrade() else {
                // Tearing down; nobody left to handle the message.
                fallback();
                return;
            };
            let core = Core::from_inner(core);
            let mut handled = false;
            for receiver in state.receivers.values() {
                handled |= receiver.receive(&message, &core);
            }
            if !handled {
                fallback();
            }
        });
    }

    pub fn barrier(&self) -> QuiescenceBarrier {
        self.lane.barrier()
    }
}

/// Cheap handle for emitting self-monitoring messages from the storage and
/// upload pipelines. Messages go out on the bus; unhandled ones fall back to
/// the log.
#[derive(Clone)]
pub(crate) struct Telemetry {
    bus: MessageBus,
    scope: String,
}

impl Telemetry {
    pub fn new(bus: MessageBus, scope: impl Into<String>) -> Self {
        Self {
            bus,
            scope: scope.into(),
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(scope = %self.scope, "{message}");
        self.emit(TelemetryKind::Error, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(scope = %self.scope, "{message}");
        self.emit(TelemetryKind::Debug, message);
    }

    fn emit(&self, kind: TelemetryKind, message: String) {
        let telemetry = TelemetryMessage {
            kind,
            message: format!("[{}] {}", self.scope, message),
        };
        self.bus.send(Message::Telemetry(telemetry), || {});
    }
}
