use std::time::Duration;

use chatline_core::{Backend, Event, EventBus, InputFuture, InputOptions};
use futures::FutureExt;

/// Scripted backend that streams the prompt back word by word from a tokio task.
pub struct EchoBackend {
    bus: EventBus,
    tick: Duration,
}

impl EchoBackend {
    pub fn new(tick: Duration) -> Self {
        Self {
            bus: EventBus::new(),
            tick,
        }
    }
}

impl Backend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    fn events(&self) -> &EventBus {
        &self.bus
    }

    fn input(&self, prompt: String, options: InputOptions) -> Option<InputFuture> {
        let bus = self.bus.clone();
        let tick = self.tick;

        Some(
            async move {
                let InputOptions {
                    messages,
                    signal,
                    mut callbacks,
                } = options;
                let request = signal.id();
                bus.emit(&Event::input(prompt.clone()).for_request(request));

                let reply = format!(
                    "You said \"{prompt}\" after {} earlier messages.",
                    messages.len()
                );
                for word in reply.split_inclusive(' ') {
                    tokio::select! {
                        _ = signal.cancelled() => {
                            tracing::debug!(request = %request, "echo stopped");
                            callbacks.finish();
                            return;
                        }
                        _ = tokio::time::sleep(tick) => {}
                    }
                    bus.emit(&Event::chunk(word).for_request(request));
                }

                bus.emit(&Event::finish(reply).for_request(request));
                callbacks.finish();
            }
            .boxed(),
        )
    }
}
