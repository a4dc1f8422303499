use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{EncodeSnafu, IoSnafu, SettingsResult};
use crate::scroll::ScrollBehavior;

pub const SETTINGS_DIRECTORY_NAME: &str = "chatline";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "CHATLINE_";
pub const DEFAULT_SCROLL_THRESHOLD: f64 = 8.0;
pub const DEFAULT_CHAR_LIMIT: usize = 500;
pub const DEFAULT_USER_NAME: &str = "User";
pub const DEFAULT_ERROR_NAME: &str = "Error";
pub const DEFAULT_PLACEHOLDER: &str = "Type your message here...";

/// What `submit` does while another request is still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusyPolicy {
    /// Cancel the in-flight request, then start the new one.
    #[default]
    CancelAndReplace,
    /// Refuse the new prompt.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Fail `submit` instead of ignoring it when no backend is attached.
    #[serde(default)]
    pub require_backend: bool,
    #[serde(default)]
    pub busy_policy: BusyPolicy,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_error_name")]
    pub error_name: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            require_backend: false,
            busy_policy: BusyPolicy::default(),
            user_name: default_user_name(),
            error_name: default_error_name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollSettings {
    /// Geometry changes at or below this distance are treated as noise.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub follow_behavior: ScrollBehavior,
}

impl Default for ScrollSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SCROLL_THRESHOLD,
            follow_behavior: ScrollBehavior::default(),
        }
    }
}

impl ScrollSettings {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    fn normalized(mut self) -> Self {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            self.threshold = DEFAULT_SCROLL_THRESHOLD;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposerSettings {
    #[serde(default = "default_char_limit")]
    pub char_limit: usize,
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
}

impl Default for ComposerSettings {
    fn default() -> Self {
        Self {
            char_limit: DEFAULT_CHAR_LIMIT,
            placeholder: default_placeholder(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub scroll: ScrollSettings,
    #[serde(default)]
    pub composer: ComposerSettings,
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.session.user_name = non_blank_or(self.session.user_name, DEFAULT_USER_NAME);
        self.session.error_name = non_blank_or(self.session.error_name, DEFAULT_ERROR_NAME);
        self.scroll = self.scroll.normalized();
        if self.composer.char_limit == 0 {
            self.composer.char_limit = DEFAULT_CHAR_LIMIT;
        }
        self.composer.placeholder = non_blank_or(self.composer.placeholder, DEFAULT_PLACEHOLDER);
        self
    }
}

/// Layered settings cache: defaults, then the JSON file, then `CHATLINE_*` env.
///
/// Readers get a cheap `Arc` of the current value; edits replace it wholesale
/// once the file on disk has been rewritten.
pub struct SettingsStore {
    settings: ArcSwap<ChatSettings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join(SETTINGS_DIRECTORY_NAME),
            None => PathBuf::from(".").join(SETTINGS_DIRECTORY_NAME),
        }
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Loads the layers for `config_path`. A missing or broken file is not an
    /// error; defaults fill in.
    pub fn new(config_path: PathBuf) -> Self {
        let settings = layered(&config_path);
        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
        }
    }

    /// Store backed by `<config dir>/chatline/settings.json`.
    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    /// Re-reads every layer, e.g. after the file was edited by hand.
    pub fn reload(&self) -> Arc<ChatSettings> {
        let settings = Arc::new(layered(&self.config_path));
        self.settings.store(Arc::clone(&settings));
        settings
    }

    /// Applies `edit` to a copy of the current settings, writes the result and
    /// only then publishes it. On error the cached value is left untouched.
    pub fn update(
        &self,
        edit: impl FnOnce(&mut ChatSettings),
    ) -> SettingsResult<Arc<ChatSettings>> {
        let mut draft = ChatSettings::clone(&self.settings.load());
        edit(&mut draft);
        let settings = Arc::new(draft.normalized());

        write_json(&self.config_path, settings.as_ref())?;
        self.settings.store(Arc::clone(&settings));
        Ok(settings)
    }

    /// Writes the current settings if no file exists yet. Returns true when a
    /// file was created.
    pub fn seed(&self) -> SettingsResult<bool> {
        if self.config_path.exists() {
            return Ok(false);
        }
        write_json(&self.config_path, self.settings().as_ref())?;
        Ok(true)
    }
}

fn layered(path: &Path) -> ChatSettings {
    let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
    if path.is_file() {
        figment = figment.merge(Json::file(path));
    } else {
        tracing::debug!(path = %path.display(), "no settings file, using defaults");
    }

    match figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract::<ChatSettings>()
    {
        Ok(settings) => settings.normalized(),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "ignoring unreadable settings");
            ChatSettings::default()
        }
    }
}

/// Replaces `path` with the pretty JSON of `value` through a sibling temp file,
/// so readers never observe a half-written file.
fn write_json(path: &Path, value: &impl Serialize) -> SettingsResult<()> {
    let json = serde_json::to_vec_pretty(value).context(EncodeSnafu {
        stage: "encode-settings",
    })?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).context(IoSnafu {
        stage: "create-settings-dir",
        path: dir.to_path_buf(),
    })?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| SETTINGS_FILE_NAME.to_string());
    let staging = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));
    std::fs::write(&staging, json).context(IoSnafu {
        stage: "write-staging-file",
        path: staging.clone(),
    })?;

    if let Err(source) = std::fs::rename(&staging, path) {
        let _ = std::fs::remove_file(&staging);
        return Err(source).context(IoSnafu {
            stage: "replace-settings-file",
            path: path.to_path_buf(),
        });
    }

    tracing::info!(path = %path.display(), "settings written");
    Ok(())
}

fn non_blank_or(value: String, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn default_user_name() -> String {
    DEFAULT_USER_NAME.to_string()
}

fn default_error_name() -> String {
    DEFAULT_ERROR_NAME.to_string()
}

fn default_threshold() -> f64 {
    DEFAULT_SCROLL_THRESHOLD
}

fn default_char_limit() -> usize {
    DEFAULT_CHAR_LIMIT
}

fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER.to_string()
}
