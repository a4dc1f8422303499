use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{Backend, InputCallbacks, InputFuture, InputOptions};
use crate::bus::{Registry, Subscription};
use crate::error::{BackendMissingSnafu, RequestInFlightSnafu, SessionResult};
use crate::events::{Event, EventKind, EventPayload};
use crate::message::{Message, Role, random_id};
use crate::request::{RequestController, RequestId, RequestToken};
use crate::settings::{BusyPolicy, SessionSettings};

/// Where the session is in the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    /// A prompt was accepted and nothing has arrived for it yet.
    AwaitingResponse,
    /// At least one `message` or `chunk` arrived for the pending request.
    Streaming,
}

impl SessionPhase {
    pub fn is_pending(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// State handed to UI observers after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub transcript: Vec<Message>,
    pub pending: bool,
    pub phase: SessionPhase,
}

/// Result of folding one backend event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    Applied,
    /// `input` echo of a prompt the session already appended.
    Echo,
    /// Tagged with a request that is no longer the active one.
    Stale {
        event_request: RequestId,
        active: Option<RequestId>,
    },
    /// Delivered by a backend the session has since detached from.
    Detached,
}

/// Outcome of `submit`.
pub struct Submission {
    token: Option<RequestToken>,
    work: Option<InputFuture>,
}

impl Submission {
    fn unrouted() -> Self {
        Self {
            token: None,
            work: None,
        }
    }

    /// Token for the started request; `None` when no backend took the prompt.
    pub fn token(&self) -> Option<&RequestToken> {
        self.token.as_ref()
    }

    pub fn is_routed(&self) -> bool {
        self.token.is_some()
    }

    /// Deferred backend work the caller should drive, e.g. with `tokio::spawn`.
    pub fn into_work(self) -> Option<InputFuture> {
        self.work
    }
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Submission")
            .field("request", &self.token.as_ref().map(RequestToken::id))
            .field("deferred", &self.work.is_some())
            .finish()
    }
}

type ObserverFn = dyn Fn(&ChatSnapshot) + Send + Sync;

struct SessionState {
    backend: Option<Arc<dyn Backend>>,
    /// Bumped on every backend swap; bus handlers carry the value they were
    /// created with.
    attachment: u64,
    subscriptions: Vec<Subscription>,
    transcript: Vec<Message>,
    phase: SessionPhase,
    /// Assistant message that chunks of the current request extend.
    streaming_message: Option<String>,
    requests: RequestController,
}

impl SessionState {
    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            transcript: self.transcript.clone(),
            pending: self.phase.is_pending(),
            phase: self.phase,
        }
    }

    fn reset_request(&mut self) {
        self.phase = SessionPhase::Idle;
        self.streaming_message = None;
    }

    fn fold(&mut self, event: &Event, settings: &SessionSettings) -> EventDisposition {
        if let Some(event_request) = event.request {
            let active = self.requests.active_id();
            if active != Some(event_request) {
                tracing::debug!(
                    request = %event_request,
                    kind = event.kind().as_str(),
                    "dropping stale event"
                );
                return EventDisposition::Stale {
                    event_request,
                    active,
                };
            }
        }

        match &event.payload {
            EventPayload::Input { prompt } => {
                if self.phase.is_pending() {
                    return EventDisposition::Echo;
                }
                // Prompt started outside this session, e.g. another surface on the same backend.
                self.transcript.push(
                    Message::user(event.id.clone(), prompt.clone())
                        .with_name(settings.user_name.clone()),
                );
                self.phase = SessionPhase::AwaitingResponse;
                self.streaming_message = None;
            }
            EventPayload::Message(message) => {
                self.transcript.push(message.clone());
                self.mark_first_token();
            }
            EventPayload::Chunk { chunk } => {
                self.append_chunk(&event.id, chunk);
                self.mark_first_token();
            }
            EventPayload::Error { error } => {
                tracing::warn!(request = ?event.request, error = %error, "chat request failed");
                self.transcript.push(
                    Message::system(event.id.clone(), error.clone())
                        .with_name(settings.error_name.clone()),
                );
                self.settle(event.request);
            }
            EventPayload::Finish { .. } => self.settle(event.request),
        }

        EventDisposition::Applied
    }

    /// A complete `message` closes the open bubble, so later chunks start a new one.
    fn append_chunk(&mut self, event_id: &str, chunk: &str) {
        let extends_open = match (self.transcript.last(), &self.streaming_message) {
            (Some(last), Some(open)) => last.role == Role::Assistant && last.id == *open,
            _ => false,
        };

        if extends_open {
            if let Some(last) = self.transcript.last_mut() {
                last.content.push_str(chunk);
            }
            return;
        }

        let message = Message::assistant(event_id, chunk);
        self.streaming_message = Some(message.id.clone());
        self.transcript.push(message);
    }

    fn mark_first_token(&mut self) {
        if self.phase == SessionPhase::AwaitingResponse {
            self.phase = SessionPhase::Streaming;
        }
    }

    fn settle(&mut self, request: Option<RequestId>) {
        match request {
            Some(id) => {
                self.requests.settle(id);
            }
            None => {
                self.requests.detach();
            }
        }
        self.reset_request();
    }
}

/// Snapshots waiting for observers, in the order their transitions happened.
///
/// Only one thread drains at a time; everyone else just queues, so observers
/// never see an older state after a newer one.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<ChatSnapshot>,
    draining: bool,
}

struct SessionShared {
    settings: SessionSettings,
    state: Mutex<SessionState>,
    outbox: Mutex<Outbox>,
    observers: Arc<Registry<ObserverFn>>,
}

/// Releases the drain when an observer panics mid-delivery.
struct DrainGuard<'a> {
    outbox: &'a Mutex<Outbox>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .draining = false;
        }
    }
}

/// Chat session core: folds backend events into a transcript and owns the
/// single in-flight request.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct ChatSession {
    shared: Arc<SessionShared>,
}

impl ChatSession {
    /// Creates a session and subscribes to `backend` before any prompt is sent.
    pub fn new(backend: Option<Arc<dyn Backend>>, settings: SessionSettings) -> Self {
        let session = Self {
            shared: Arc::new(SessionShared {
                settings,
                state: Mutex::new(SessionState {
                    backend: None,
                    attachment: 0,
                    subscriptions: Vec::new(),
                    transcript: Vec::new(),
                    phase: SessionPhase::Idle,
                    streaming_message: None,
                    requests: RequestController::new(),
                }),
                outbox: Mutex::new(Outbox::default()),
                observers: Registry::new(),
            }),
        };
        session.attach(backend);
        session
    }

    /// Seeds the transcript, e.g. with a greeting or restored history.
    pub fn with_transcript(self, messages: Vec<Message>) -> Self {
        self.lock_state().transcript = messages;
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.lock_state().snapshot()
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.lock_state().transcript.clone()
    }

    pub fn pending(&self) -> bool {
        self.lock_state().phase.is_pending()
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock_state().phase
    }

    /// True between accepting a prompt and the first message or chunk for it.
    pub fn awaiting_first_token(&self) -> bool {
        self.phase() == SessionPhase::AwaitingResponse
    }

    pub fn backend_name(&self) -> Option<String> {
        self.lock_state()
            .backend
            .as_ref()
            .map(|backend| backend.name().to_string())
    }

    pub fn active_request(&self) -> Option<RequestId> {
        self.lock_state().requests.active_id()
    }

    pub fn is_active(&self, token: &RequestToken) -> bool {
        self.lock_state().requests.is_active(token)
    }

    /// Registers a UI observer called after every transcript or pending change.
    ///
    /// Snapshots reach observers in transition order. An observer may call back
    /// into the session; the resulting snapshot is delivered after it returns.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChatSnapshot) + Send + Sync + 'static,
    {
        self.shared.observers.insert(Arc::new(listener))
    }

    /// Listens to raw events on the attached backend's bus.
    ///
    /// The subscription stays with that backend after [`ChatSession::use_backend`].
    /// Returns `Ok(None)` when no backend is attached and none is required.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SessionResult<Option<Subscription>>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let backend = self.lock_state().backend.clone();
        match backend {
            Some(backend) => Ok(Some(backend.events().on(kind, handler))),
            None if self.shared.settings.require_backend => {
                BackendMissingSnafu { stage: "on" }.fail()
            }
            None => Ok(None),
        }
    }

    pub fn submit(&self, prompt: impl Into<String>) -> SessionResult<Submission> {
        self.submit_with(prompt, InputCallbacks::default())
    }

    /// Appends the prompt as a user message and hands it to the backend.
    ///
    /// Fails synchronously with `BackendMissing` when no backend is attached and
    /// one is required; without that requirement the prompt is dropped and the
    /// returned submission is unrouted. A request that is still pending is
    /// cancelled first, or the call is refused, depending on `busy_policy`.
    pub fn submit_with(
        &self,
        prompt: impl Into<String>,
        callbacks: InputCallbacks,
    ) -> SessionResult<Submission> {
        let prompt = prompt.into();
        let settings = &self.shared.settings;

        let (backend, token, history) = {
            let mut state = self.lock_state();
            let Some(backend) = state.backend.clone() else {
                if settings.require_backend {
                    return BackendMissingSnafu { stage: "submit" }.fail();
                }
                tracing::warn!("prompt dropped because no chat backend is attached");
                return Ok(Submission::unrouted());
            };

            if state.phase.is_pending() && settings.busy_policy == BusyPolicy::Reject {
                return RequestInFlightSnafu { stage: "submit" }.fail();
            }

            let history = state.transcript.clone();
            let (token, superseded) = state.requests.begin();
            if let Some(superseded) = superseded {
                tracing::debug!(
                    superseded = %superseded,
                    request = %token.id(),
                    "cancelled in-flight request to start a new one"
                );
            }

            state.transcript.push(
                Message::user(random_id(), prompt.clone()).with_name(settings.user_name.clone()),
            );
            state.phase = SessionPhase::AwaitingResponse;
            state.streaming_message = None;
            self.enqueue(&state);
            (backend, token, history)
        };

        self.flush();

        tracing::debug!(backend = backend.name(), request = %token.id(), "submitting prompt");
        let work = backend.input(
            prompt,
            InputOptions {
                messages: history,
                signal: token.clone(),
                callbacks,
            },
        );

        Ok(Submission {
            token: Some(token),
            work,
        })
    }

    /// Folds one backend event into the transcript.
    pub fn apply_event(&self, event: &Event) -> EventDisposition {
        self.apply_from(None, event)
    }

    fn apply_from(&self, attachment: Option<u64>, event: &Event) -> EventDisposition {
        let disposition = {
            let mut state = self.lock_state();
            if attachment.is_some_and(|attachment| attachment != state.attachment) {
                return EventDisposition::Detached;
            }
            let disposition = state.fold(event, &self.shared.settings);
            if disposition == EventDisposition::Applied {
                self.enqueue(&state);
            }
            disposition
        };

        self.flush();
        disposition
    }

    /// Cancels whatever request is pending and clears the pending flag at once,
    /// without waiting for the backend. Returns false when nothing was pending.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.lock_state();
            let cancelled = state.requests.cancel();
            if cancelled.is_none() && !state.phase.is_pending() {
                return false;
            }
            if let Some(request) = cancelled {
                tracing::debug!(request = %request, "request cancelled");
            }
            state.reset_request();
            self.enqueue(&state);
        }

        self.flush();
        true
    }

    /// Cancels `token` if it is still the active request; otherwise a no-op.
    pub fn cancel_request(&self, token: &RequestToken) -> bool {
        {
            let mut state = self.lock_state();
            if !state.requests.cancel_token(token) {
                return false;
            }
            tracing::debug!(request = %token.id(), "request cancelled");
            state.reset_request();
            self.enqueue(&state);
        }

        self.flush();
        true
    }

    /// Empties the transcript and returns to idle.
    ///
    /// The in-flight request is not signalled, only forgotten: its later tagged
    /// events are dropped as stale. Call [`ChatSession::cancel`] first to stop it.
    pub fn clear(&self) {
        self.set_transcript(Vec::new());
    }

    /// Replaces the transcript wholesale, with the same request handling as `clear`.
    pub fn set_transcript(&self, messages: Vec<Message>) {
        {
            let mut state = self.lock_state();
            if let Some(request) = state.requests.detach() {
                tracing::debug!(request = %request, "transcript replaced; request detached");
            }
            state.transcript = messages;
            state.reset_request();
            self.enqueue(&state);
        }

        self.flush();
    }

    /// Swaps the backend, cancelling any pending request on the old one.
    pub fn use_backend(&self, backend: Option<Arc<dyn Backend>>) {
        if self.attach(backend) {
            self.flush();
        }
    }

    /// Returns true when a snapshot was queued because a request was dropped.
    fn attach(&self, backend: Option<Arc<dyn Backend>>) -> bool {
        let (previous, was_pending) = {
            let mut state = self.lock_state();
            state.requests.cancel();
            let was_pending = state.phase.is_pending();
            state.reset_request();

            state.attachment += 1;
            let subscriptions = backend
                .as_ref()
                .map(|backend| self.subscribe_to(backend.as_ref(), state.attachment))
                .unwrap_or_default();
            if let Some(backend) = &backend {
                tracing::debug!(backend = backend.name(), "session attached to backend");
            }
            state.backend = backend;
            let previous = std::mem::replace(&mut state.subscriptions, subscriptions);

            if was_pending {
                self.enqueue(&state);
            }
            (previous, was_pending)
        };

        drop(previous);
        was_pending
    }

    fn subscribe_to(&self, backend: &dyn Backend, attachment: u64) -> Vec<Subscription> {
        let shared = Arc::downgrade(&self.shared);
        EventKind::ALL
            .iter()
            .map(|kind| {
                let shared = shared.clone();
                backend.events().on(*kind, move |event| {
                    if let Some(shared) = shared.upgrade() {
                        ChatSession { shared }.apply_from(Some(attachment), event);
                    }
                })
            })
            .collect()
    }

    /// Queues the current state for observers. Must run under the state lock so
    /// queue order matches transition order.
    fn enqueue(&self, state: &SessionState) {
        self.lock_outbox().queue.push_back(state.snapshot());
    }

    /// Delivers queued snapshots unless another call is already doing so.
    fn flush(&self) {
        {
            let mut outbox = self.lock_outbox();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        let _guard = DrainGuard {
            outbox: &self.shared.outbox,
        };

        loop {
            let next = {
                let mut outbox = self.lock_outbox();
                let next = outbox.queue.pop_front();
                // Release under the same lock as the empty check, or a snapshot
                // queued in between would never be delivered.
                outbox.draining = next.is_some();
                next
            };
            let Some(snapshot) = next else {
                return;
            };
            for observer in self.shared.observers.snapshot() {
                observer(&snapshot);
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbox(&self) -> MutexGuard<'_, Outbox> {
        self.shared
            .outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::message::Align;

    #[derive(Default)]
    struct ScriptedBackend {
        bus: EventBus,
        inputs: Mutex<Vec<(String, Vec<Message>, RequestToken)>>,
    }

    impl ScriptedBackend {
        fn emit(&self, event: Event) {
            self.bus.emit(&event);
        }

        fn last_token(&self) -> RequestToken {
            self.inputs.lock().unwrap().last().unwrap().2.clone()
        }
    }

    impl Backend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn events(&self) -> &EventBus {
            &self.bus
        }

        fn input(&self, prompt: String, options: InputOptions) -> Option<InputFuture> {
            self.inputs
                .lock()
                .unwrap()
                .push((prompt, options.messages, options.signal));
            None
        }
    }

    /// Emits the whole reply from inside `input`.
    #[derive(Default)]
    struct InlineBackend {
        bus: EventBus,
    }

    impl Backend for InlineBackend {
        fn name(&self) -> &str {
            "inline"
        }

        fn events(&self) -> &EventBus {
            &self.bus
        }

        fn input(&self, prompt: String, mut options: InputOptions) -> Option<InputFuture> {
            let request = options.signal.id();
            self.bus.emit(&Event::input(prompt.clone()).for_request(request));
            self.bus
                .emit(&Event::chunk(prompt.to_uppercase()).for_request(request));
            self.bus.emit(&Event::finish("").for_request(request));
            options.callbacks.finish();
            None
        }
    }

    fn session_with(settings: SessionSettings) -> (Arc<ScriptedBackend>, ChatSession) {
        let backend = Arc::new(ScriptedBackend::default());
        let session = ChatSession::new(Some(backend.clone()), settings);
        (backend, session)
    }

    fn session() -> (Arc<ScriptedBackend>, ChatSession) {
        session_with(SessionSettings::default())
    }

    fn contents(session: &ChatSession) -> Vec<(Role, String)> {
        session
            .transcript()
            .into_iter()
            .map(|message| (message.role, message.content))
            .collect()
    }

    #[test]
    fn streamed_reply_is_assembled_into_one_assistant_message() {
        let (backend, session) = session();
        session.submit("hello").unwrap();
        let request = backend.last_token().id();

        backend.emit(Event::chunk("Hi").for_request(request));
        backend.emit(Event::chunk(" there").for_request(request));
        backend.emit(Event::finish("").for_request(request));

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[0].content, "hello");
        assert_eq!(transcript[0].align, Some(Align::Right));
        assert_eq!(transcript[0].name.as_deref(), Some("User"));
        assert_eq!(transcript[1].role, Role::Assistant);
        assert_eq!(transcript[1].content, "Hi there");
        assert_eq!(transcript[1].align, Some(Align::Left));
        assert!(!session.pending());
    }

    #[test]
    fn chunk_content_is_concatenation_in_emission_order() {
        let (backend, session) = session();
        session.submit("go").unwrap();
        let request = backend.last_token().id();
        let chunks = ["", "a", "ü", "  ", "\n", "b€", ""];

        for chunk in chunks {
            backend.emit(Event::chunk(chunk).for_request(request));
        }

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].content, chunks.concat());
        assert!(session.pending());
        assert_eq!(session.phase(), SessionPhase::Streaming);
    }

    #[test]
    fn backend_error_becomes_centered_system_message() {
        let (backend, session) = session();
        session.submit("x").unwrap();
        let request = backend.last_token().id();

        backend.emit(Event::error("rate limited").for_request(request));

        let transcript = session.transcript();
        let last = transcript.last().unwrap();
        assert_eq!(last.role, Role::System);
        assert_eq!(last.content, "rate limited");
        assert_eq!(last.align, Some(Align::Center));
        assert_eq!(last.name.as_deref(), Some("Error"));
        assert!(!session.pending());
        assert_eq!(session.active_request(), None);
    }

    #[test]
    fn finish_without_content_clears_pending() {
        let (backend, session) = session();
        session.submit("anyone?").unwrap();
        assert!(session.awaiting_first_token());

        backend.emit(Event::finish("").for_request(backend.last_token().id()));

        assert!(!session.pending());
        assert_eq!(contents(&session), vec![(Role::User, "anyone?".to_string())]);
    }

    #[test]
    fn finish_after_error_is_idempotent() {
        let (backend, session) = session();
        session.submit("x").unwrap();
        backend.emit(Event::error("boom"));
        let before = session.transcript();

        assert_eq!(
            session.apply_event(&Event::finish("")),
            EventDisposition::Applied
        );

        assert!(!session.pending());
        assert_eq!(session.transcript(), before);
    }

    #[test]
    fn events_after_cancel_are_dropped() {
        let (backend, session) = session();
        session.submit("long answer").unwrap();
        let token = backend.last_token();
        backend.emit(Event::chunk("partial").for_request(token.id()));

        assert!(session.cancel());
        assert!(!session.pending());
        assert!(token.is_cancelled());
        assert!(!session.is_active(&token));
        let before = session.transcript();

        let late = Event::chunk(" more").for_request(token.id());
        assert_eq!(
            session.apply_event(&late),
            EventDisposition::Stale {
                event_request: token.id(),
                active: None,
            }
        );
        backend.emit(Event::finish("").for_request(token.id()));
        backend.emit(Event::error("aborted").for_request(token.id()));

        assert_eq!(session.transcript(), before);
        assert!(!session.cancel());
        assert!(!session.cancel_request(&token));
    }

    #[test]
    fn cancel_request_only_hits_the_active_token() {
        let (backend, session) = session();
        session.submit("first").unwrap();
        let first = backend.last_token();
        session.submit("second").unwrap();
        let second = backend.last_token();

        assert!(!session.cancel_request(&first));
        assert!(session.pending());
        assert!(session.cancel_request(&second));
        assert!(!session.pending());
    }

    #[test]
    fn clear_mid_flight_empties_transcript_and_ignores_stale_request() {
        let (backend, session) = session();
        session.submit("hello").unwrap();
        let token = backend.last_token();
        backend.emit(Event::chunk("Hi").for_request(token.id()));

        session.clear();

        assert!(session.transcript().is_empty());
        assert!(!session.pending());
        assert!(!token.is_cancelled());

        backend.emit(Event::chunk(" again").for_request(token.id()));
        backend.emit(Event::finish("").for_request(token.id()));
        assert!(session.transcript().is_empty());
        assert!(!session.pending());
    }

    #[test]
    fn missing_backend_fails_synchronously_when_required() {
        let session = ChatSession::new(
            None,
            SessionSettings {
                require_backend: true,
                ..SessionSettings::default()
            },
        );

        let error = session.submit("hello").unwrap_err();

        assert!(matches!(error, crate::SessionError::BackendMissing { .. }));
        assert!(session.transcript().is_empty());
        assert!(!session.pending());
    }

    #[test]
    fn missing_backend_is_ignored_when_optional() {
        let session = ChatSession::new(None, SessionSettings::default());

        let submission = session.submit("hello").unwrap();

        assert!(!submission.is_routed());
        assert!(submission.into_work().is_none());
        assert!(session.transcript().is_empty());
        assert!(!session.pending());
    }

    #[test]
    fn second_submit_cancels_and_replaces_the_first() {
        let (backend, session) = session();
        session.submit("first").unwrap();
        let first = backend.last_token();
        backend.emit(Event::chunk("one").for_request(first.id()));

        session.submit("second").unwrap();
        let second = backend.last_token();
        assert!(first.is_cancelled());

        backend.emit(Event::chunk("late").for_request(first.id()));
        backend.emit(Event::chunk("two").for_request(second.id()));
        backend.emit(Event::finish("").for_request(first.id()));
        assert!(session.pending());
        backend.emit(Event::finish("").for_request(second.id()));

        assert_eq!(
            contents(&session),
            vec![
                (Role::User, "first".to_string()),
                (Role::Assistant, "one".to_string()),
                (Role::User, "second".to_string()),
                (Role::Assistant, "two".to_string()),
            ]
        );
        assert!(!session.pending());

        let inputs = backend.inputs.lock().unwrap();
        let history: Vec<_> = inputs[1].1.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["first", "one"]);
    }

    #[test]
    fn reject_policy_refuses_second_submit() {
        let (backend, session) = session_with(SessionSettings {
            busy_policy: BusyPolicy::Reject,
            ..SessionSettings::default()
        });
        session.submit("first").unwrap();
        let first = backend.last_token();

        let error = session.submit("second").unwrap_err();

        assert!(matches!(error, crate::SessionError::RequestInFlight { .. }));
        assert!(!first.is_cancelled());
        assert_eq!(session.transcript().len(), 1);
        assert_eq!(backend.inputs.lock().unwrap().len(), 1);
    }

    #[test]
    fn message_event_is_appended_verbatim_and_keeps_pending() {
        let (backend, session) = session();
        session.submit("q").unwrap();
        let request = backend.last_token().id();
        let reply = Message::new("srv-1", Role::Developer, "note").with_name("tool");

        backend.emit(Event::message(reply.clone()).for_request(request));

        assert_eq!(session.transcript().last(), Some(&reply));
        assert!(session.pending());
        assert!(!session.awaiting_first_token());
    }

    #[test]
    fn chunk_after_message_opens_a_new_bubble() {
        let (backend, session) = session();
        session.submit("q").unwrap();
        let request = backend.last_token().id();

        backend.emit(Event::chunk("a").for_request(request));
        backend.emit(Event::message(Message::assistant("m", "full")).for_request(request));
        backend.emit(Event::chunk("b").for_request(request));

        assert_eq!(
            contents(&session)[1..],
            [
                (Role::Assistant, "a".to_string()),
                (Role::Assistant, "full".to_string()),
                (Role::Assistant, "b".to_string()),
            ]
        );
    }

    #[test]
    fn untagged_input_while_idle_starts_a_request_and_echo_is_ignored() {
        let (backend, session) = session();

        backend.emit(Event::input("from elsewhere"));
        assert!(session.pending());
        assert_eq!(session.transcript().len(), 1);

        assert_eq!(
            session.apply_event(&Event::input("from elsewhere")),
            EventDisposition::Echo
        );
        backend.emit(Event::chunk("ok"));
        backend.emit(Event::finish(""));

        assert_eq!(session.transcript().len(), 2);
        assert!(!session.pending());
    }

    #[test]
    fn observers_see_every_transition() {
        let (backend, session) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = session.subscribe(move |snapshot| {
            sink.lock()
                .unwrap()
                .push((snapshot.phase, snapshot.transcript.len()));
        });

        session.submit("hello").unwrap();
        let request = backend.last_token().id();
        backend.emit(Event::chunk("Hi").for_request(request));
        backend.emit(Event::finish("").for_request(request));
        drop(subscription);
        session.clear();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (SessionPhase::AwaitingResponse, 1),
                (SessionPhase::Streaming, 2),
                (SessionPhase::Idle, 2),
            ]
        );
    }

    #[test]
    fn backend_emitting_inside_input_does_not_deadlock() {
        let backend = Arc::new(InlineBackend::default());
        let session = ChatSession::new(Some(backend), SessionSettings::default());
        let finished = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&finished);

        session
            .submit_with(
                "ping",
                InputCallbacks::on_finish(move || *flag.lock().unwrap() = true),
            )
            .unwrap();

        assert_eq!(
            contents(&session),
            vec![
                (Role::User, "ping".to_string()),
                (Role::Assistant, "PING".to_string()),
            ]
        );
        assert!(!session.pending());
        assert!(*finished.lock().unwrap());
    }

    #[test]
    fn switching_backends_unsubscribes_the_old_one() {
        let (old, session) = session();
        session.submit("q").unwrap();
        let old_token = old.last_token();
        let new = Arc::new(ScriptedBackend::default());

        session.use_backend(Some(new.clone()));

        assert!(old_token.is_cancelled());
        assert!(!session.pending());
        assert_eq!(old.bus.subscriber_count(EventKind::Chunk), 0);
        assert_eq!(session.backend_name().as_deref(), Some("scripted"));

        old.emit(Event::chunk("ghost"));
        session.submit("again").unwrap();
        new.emit(Event::chunk("real").for_request(new.last_token().id()));

        assert_eq!(
            contents(&session).last(),
            Some(&(Role::Assistant, "real".to_string()))
        );
        assert_eq!(session.transcript().len(), 3);
    }

    #[test]
    fn seeded_transcript_is_forwarded_as_context() {
        let backend = Arc::new(ScriptedBackend::default());
        let session = ChatSession::new(Some(backend.clone()), SessionSettings::default())
            .with_transcript(vec![Message::assistant("greet", "How can I help?")]);

        session.submit("hi").unwrap();

        let inputs = backend.inputs.lock().unwrap();
        assert_eq!(inputs[0].0, "hi");
        assert_eq!(inputs[0].1.len(), 1);
        assert_eq!(inputs[0].1[0].id, "greet");
    }

    #[test]
    fn dropping_the_session_releases_backend_subscriptions() {
        let (backend, session) = session();
        assert_eq!(backend.bus.subscriber_count(EventKind::Finish), 1);

        drop(session);

        assert_eq!(backend.bus.subscriber_count(EventKind::Finish), 0);
    }

    #[test]
    fn cancel_is_the_last_state_observers_see_when_racing_a_worker() {
        let (backend, session) = session();
        session.submit("hello").unwrap();
        let request = backend.last_token().id();

        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        let last_pending = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&last_pending);
        let _subscription = session.subscribe(move |snapshot| {
            if snapshot.phase == SessionPhase::Streaming {
                entered_tx.lock().unwrap().send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
            *sink.lock().unwrap() = Some(snapshot.pending);
        });

        let worker = {
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || {
                backend.emit(Event::chunk("Hi").for_request(request));
            })
        };
        entered_rx.recv().unwrap();

        assert!(session.cancel());
        assert!(!session.pending());
        release_tx.send(()).unwrap();
        worker.join().unwrap();

        assert_eq!(*last_pending.lock().unwrap(), Some(false));
    }

    #[test]
    fn observer_may_call_back_into_the_session() {
        let (backend, session) = session();
        let phases = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&phases);
        let handle = session.clone();
        let _subscription = session.subscribe(move |snapshot| {
            sink.lock().unwrap().push(snapshot.phase);
            if snapshot.phase == SessionPhase::Streaming {
                handle.cancel();
            }
        });

        session.submit("q").unwrap();
        backend.emit(Event::chunk("a").for_request(backend.last_token().id()));

        assert!(!session.pending());
        assert_eq!(
            *phases.lock().unwrap(),
            vec![
                SessionPhase::AwaitingResponse,
                SessionPhase::Streaming,
                SessionPhase::Idle,
            ]
        );
    }

    #[test]
    fn reattaching_the_same_backend_folds_each_event_once() {
        let (backend, session) = session();

        session.use_backend(Some(backend.clone()));

        assert_eq!(backend.bus.subscriber_count(EventKind::Chunk), 1);
        session.submit("q").unwrap();
        backend.emit(Event::chunk("once").for_request(backend.last_token().id()));
        assert_eq!(
            contents(&session).last(),
            Some(&(Role::Assistant, "once".to_string()))
        );
    }

    #[test]
    fn on_forwards_to_the_attached_backend() {
        let (backend, session) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let subscription = session
            .on(EventKind::Error, move |event| {
                sink.lock().unwrap().push(event.id.clone());
            })
            .unwrap()
            .expect("backend is attached");
        backend.emit(Event::error("down").with_id("e-1"));
        drop(subscription);
        backend.emit(Event::error("down").with_id("e-2"));

        assert_eq!(*seen.lock().unwrap(), vec!["e-1".to_string()]);
    }

    #[test]
    fn on_without_backend_follows_require_backend() {
        let optional = ChatSession::new(None, SessionSettings::default());
        assert!(optional.on(EventKind::Chunk, |_| {}).unwrap().is_none());

        let required = ChatSession::new(
            None,
            SessionSettings {
                require_backend: true,
                ..SessionSettings::default()
            },
        );
        assert!(matches!(
            required.on(EventKind::Chunk, |_| {}),
            Err(crate::SessionError::BackendMissing { .. })
        ));
    }
}
