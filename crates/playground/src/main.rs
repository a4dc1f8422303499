use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chatline_core::{
    ChatSession, Composer, FollowScroll, Message, SendOutcome, SessionResult, SettingsStore,
    Submission,
};
use tokio::task::JoinHandle;

mod echo;
mod viewport;

use echo::EchoBackend;
use viewport::LineViewport;

const VISIBLE_LINES: usize = 6;
const ECHO_TICK: Duration = Duration::from_millis(40);

/// Runs a scripted conversation against the echo backend.
///
/// Usage: `chatline [SETTINGS_PATH]`. Without a path the settings come from the
/// user config directory.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let store = match std::env::args_os().nth(1) {
        Some(path) => SettingsStore::new(PathBuf::from(path)),
        None => SettingsStore::load(),
    };
    tracing::info!("using settings from {:?}", store.config_path());
    match store.seed() {
        Ok(true) => tracing::info!("wrote default settings for editing"),
        Ok(false) => {}
        Err(error) => tracing::warn!("could not write default settings: {}", error),
    }

    if let Err(error) = run(&store).await {
        tracing::error!("playground failed: {}", error);
        std::process::exit(1);
    }
}

async fn run(store: &SettingsStore) -> SessionResult<()> {
    let settings = store.settings();
    let session = ChatSession::new(
        Some(Arc::new(EchoBackend::new(ECHO_TICK))),
        settings.session.clone(),
    )
    .with_transcript(vec![Message::assistant(
        "greeting",
        "Hello! Type something and I will echo it.",
    )]);

    let follow = Arc::new(Mutex::new(FollowScroll::new(
        LineViewport::new(VISIBLE_LINES),
        settings.scroll,
    )));
    let observer = {
        let follow = Arc::clone(&follow);
        session.subscribe(move |snapshot| {
            let mut follow = follow.lock().unwrap_or_else(PoisonError::into_inner);
            let size = follow.viewport_mut().layout(&snapshot.transcript);
            follow.on_resize(size);
            if follow.on_frame() {
                tracing::info!(height = size.height, "followed new content");
            } else if follow.is_paused() {
                tracing::info!(height = size.height, "content grew; follow paused");
            }
        })
    };

    let mut composer = Composer::new(settings.composer.clone());
    println!("{}", composer.placeholder());

    composer.set_draft("hello there");
    if let Some(handle) = spawn_sent(composer.send(&session)?) {
        let _ = handle.await;
    }

    composer.set_draft("please /sum");
    if let Some(trigger) = composer.active_trigger() {
        tracing::info!(kind = ?trigger.kind, query = %trigger.query, "completing trigger");
        composer.complete("summarize");
    }
    composer.insert("the whole conversation in great detail");
    let pending = spawn_sent(composer.send(&session)?);

    tokio::time::sleep(ECHO_TICK * 4).await;
    {
        let mut follow = follow.lock().unwrap_or_else(PoisonError::into_inner);
        follow.viewport_mut().scroll_by(-40.0);
        follow.on_wheel();
        tracing::info!(paused = follow.is_paused(), "user scrolled up");
    }
    if composer.is_sending(&session)
        && let SendOutcome::Stopped = composer.send(&session)?
    {
        tracing::info!("stopped the reply early");
    }
    if let Some(handle) = pending {
        let _ = handle.await;
    }

    observer.unsubscribe();
    for message in session.transcript() {
        let name = message
            .name
            .clone()
            .unwrap_or_else(|| format!("{:?}", message.role));
        println!("{name:>10} | {}", message.content);
    }
    Ok(())
}

fn spawn_sent(outcome: SendOutcome) -> Option<JoinHandle<()>> {
    match outcome {
        SendOutcome::Sent(submission) => spawn_work(submission),
        SendOutcome::Stopped | SendOutcome::Ignored => None,
    }
}

fn spawn_work(submission: Submission) -> Option<JoinHandle<()>> {
    submission.into_work().map(tokio::spawn)
}
