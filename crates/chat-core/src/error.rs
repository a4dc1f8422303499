use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("no chat backend is configured for this session"))]
    BackendMissing { stage: &'static str },
    #[snafu(display("a request is still in flight"))]
    RequestInFlight { stage: &'static str },
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("could not encode settings as JSON on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("settings I/O failed for {} on `{stage}`: {source}", path.display()))]
    Io {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;
