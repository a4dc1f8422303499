#![deny(unsafe_code)]

/// Backend adapter contract.
pub mod backend;
/// Per-backend publish/subscribe channel.
///
/// Handlers for one event kind run synchronously, in subscription order, on
/// the emitting thread. Events emitted with no subscriber are discarded.
pub mod bus;
pub mod composer;
pub mod error;
/// Wire-shaped lifecycle events a backend emits.
pub mod events;
pub mod message;
/// Single-flight request tokens.
pub mod request;
/// Auto-follow scrolling for a growing transcript.
pub mod scroll;
/// Transcript assembly and the pending-request state machine.
pub mod session;
pub mod settings;

pub use backend::{Backend, InputCallbacks, InputFuture, InputOptions};
pub use bus::{EventBus, EventHandler, Subscription};
pub use composer::{Composer, SendOutcome, Trigger, TriggerKind};
pub use error::{SessionError, SessionResult, SettingsError, SettingsResult};
pub use events::{Event, EventKind, EventPayload};
pub use message::{Align, Avatar, Message, Role, random_id};
pub use request::{RequestController, RequestId, RequestToken};
pub use scroll::{
    FollowScroll, ScrollBehavior, SizeSnapshot, Viewport, ViewportMetrics, ViewportSignal,
};
pub use session::{ChatSession, ChatSnapshot, EventDisposition, SessionPhase, Submission};
pub use settings::{
    BusyPolicy, ChatSettings, ComposerSettings, ScrollSettings, SessionSettings, SettingsStore,
};
