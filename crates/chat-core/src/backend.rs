use futures::future::BoxFuture;

use crate::bus::{EventBus, Subscription};
use crate::events::{Event, EventKind};
use crate::message::Message;
use crate::request::RequestToken;

/// Deferred backend work for one request. The host decides where to run it.
pub type InputFuture = BoxFuture<'static, ()>;

/// Completion hooks a caller can attach to one request.
#[derive(Default)]
pub struct InputCallbacks {
    pub on_finish: Option<Box<dyn FnOnce() + Send>>,
}

impl InputCallbacks {
    pub fn on_finish(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_finish: Some(Box::new(callback)),
        }
    }

    /// Runs `on_finish` at most once.
    pub fn finish(&mut self) {
        if let Some(callback) = self.on_finish.take() {
            callback();
        }
    }
}

impl std::fmt::Debug for InputCallbacks {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InputCallbacks")
            .field("on_finish", &self.on_finish.is_some())
            .finish()
    }
}

/// Everything a backend gets alongside the prompt.
#[derive(Debug)]
pub struct InputOptions {
    /// Transcript as it was before this prompt, for multi-turn context.
    pub messages: Vec<Message>,
    /// Cancellation handle; its id should tag every event for this request.
    pub signal: RequestToken,
    pub callbacks: InputCallbacks,
}

/// Contract a concrete chat backend implements.
///
/// Backends report progress only through their [`EventBus`]: optionally an
/// `input` echo, then any number of `message`/`chunk` events, then exactly one
/// `finish` or `error`. Once `options.signal` is cancelled they should stop
/// emitting for that request.
pub trait Backend: Send + Sync {
    /// Informational identifier.
    fn name(&self) -> &str;

    fn events(&self) -> &EventBus;

    /// Starts a request. Returns deferred work when the backend is
    /// asynchronous, or `None` when everything was emitted synchronously.
    fn input(&self, prompt: String, options: InputOptions) -> Option<InputFuture>;

    fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        Self: Sized,
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events().on(kind, handler)
    }
}
