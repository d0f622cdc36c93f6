use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::OnceCell;
use url::Url;

pub mod adapters;
pub mod backend;
pub mod capabilities;
pub mod composer;
pub mod error;
pub mod message_streaming;
pub mod messages;
pub mod notifications;
pub mod presence;
pub mod profiles;
pub mod session;

use crate::init_tracing;

use backend::{Backend, Capabilities};
use capabilities::{NoopNotifier, NotificationPlatform};
use error::{BudChatError, Result};
use profiles::ProfileStore;

/// Presence room every client joins.
pub const DEFAULT_PRESENCE_ROOM: &str = "online-users";

/// Characters of a personal message shown in the roster before it is cut.
pub const DEFAULT_STATUS_PREVIEW_LEN: usize = 20;

const ENV_BACKEND_URL: &str = "BUDCHAT_BACKEND_URL";
const ENV_BACKEND_KEY: &str = "BUDCHAT_BACKEND_KEY";
const ENV_ACCESS_TOKEN: &str = "BUDCHAT_ACCESS_TOKEN";

/// Connection settings for the hosted backend.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BackendConfig {
    /// Project base URL, e.g. `https://xyz.supabase.co`.
    pub url: String,

    /// Public anon key sent as `apikey` on every request.
    pub anon_key: String,

    /// Signed-in user's JWT. Requests fall back to the anon key without it.
    pub access_token: Option<String>,
}

#[derive(Deserialize)]
struct CredentialsFile {
    supabase: FileCredentials,
}

#[derive(Deserialize)]
struct FileCredentials {
    url: String,
    key: String,
    #[serde(default)]
    access_token: Option<String>,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            anon_key: anon_key.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Reads a `config.json` of the form `{"supabase": {"url": "...", "key": "..."}}`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file: {:?}", path))
            .map_err(BudChatError::from)?;
        let file: CredentialsFile = serde_json::from_str(&raw)?;
        Ok(Self {
            url: file.supabase.url,
            anon_key: file.supabase.key,
            access_token: file.supabase.access_token,
        })
    }

    /// Reads the process environment, after loading a `.env` file if one exists.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let config = Self::default().overridden_by(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// File settings overridden by the environment. The file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.overridden_by(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn overridden_by(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_BACKEND_URL).filter(|v| !v.is_empty()) {
            self.url = url;
        }
        if let Some(key) = lookup(ENV_BACKEND_KEY).filter(|v| !v.is_empty()) {
            self.anon_key = key;
        }
        if let Some(token) = lookup(ENV_ACCESS_TOKEN).filter(|v| !v.is_empty()) {
            self.access_token = Some(token);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(BudChatError::Configuration("backend url is missing".to_string()));
        }
        if self.anon_key.trim().is_empty() {
            return Err(BudChatError::Configuration("backend key is missing".to_string()));
        }
        self.base_url()?;
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(self.url.trim_end_matches('/')).map_err(|e| {
            BudChatError::Configuration(format!("invalid backend url {:?}: {}", self.url, e))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(BudChatError::Configuration(format!(
                "unsupported backend url scheme: {other}"
            ))),
        }
    }

    /// Token for the `Authorization: Bearer` header.
    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("anon_key", &"<REDACTED>")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct BudChatConfig {
    /// Directory for application data
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    pub backend: BackendConfig,

    /// Key of the shared presence room
    pub presence_room: String,

    /// Roster preview length for personal messages
    pub status_preview_len: usize,

    /// Whether admitted messages from others raise toasts and system notifications
    pub notifications: bool,
}

impl BudChatConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path, backend: BackendConfig) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };
        let formatted_data_dir = data_dir.join(env_suffix);
        let formatted_logs_dir = logs_dir.join(env_suffix);

        Self {
            data_dir: formatted_data_dir,
            logs_dir: formatted_logs_dir,
            backend,
            presence_room: DEFAULT_PRESENCE_ROOM.to_string(),
            status_preview_len: DEFAULT_STATUS_PREVIEW_LEN,
            notifications: true,
        }
    }

    pub fn with_presence_room(mut self, room: impl Into<String>) -> Self {
        self.presence_room = room.into();
        self
    }

    pub fn with_notifications(mut self, enabled: bool) -> Self {
        self.notifications = enabled;
        self
    }
}

/// Composition root: the backend handle and the profile store, shared by every session.
pub struct BudChat {
    pub config: BudChatConfig,
    backend: Backend,
    profiles: Arc<ProfileStore>,
}

static GLOBAL_BUDCHAT: OnceCell<BudChat> = OnceCell::const_new();

impl fmt::Debug for BudChat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudChat")
            .field("config", &self.config)
            .field("backend_ready", &self.backend.is_ready())
            .field("profiles", &self.profiles.len())
            .finish()
    }
}

impl BudChat {
    /// Initializes the process-wide instance against the hosted backend.
    ///
    /// Creates the data and log directories, installs logging, and builds the
    /// capability bundle once. Bad credentials do not fail initialization: the
    /// backend is marked failed and every session reports it on mount.
    pub async fn initialize_budchat(config: BudChatConfig) -> Result<&'static BudChat> {
        Self::initialize_budchat_with_notifier(config, Arc::new(NoopNotifier)).await
    }

    pub async fn initialize_budchat_with_notifier(
        config: BudChatConfig,
        notifier: Arc<dyn NotificationPlatform>,
    ) -> Result<&'static BudChat> {
        GLOBAL_BUDCHAT
            .get_or_try_init(|| async {
                Self::prepare_dirs(&config)?;

                let backend = Backend::new();
                match adapters::hosted_capabilities(&config.backend, notifier) {
                    Ok(capabilities) => backend.mark_ready(capabilities),
                    Err(e) => backend.mark_failed(e.to_string()),
                }

                tracing::info!(
                    target: "budchat::initialize_budchat",
                    "BudChat initialized against {}",
                    config.backend.url
                );
                Ok(Self::from_parts(config, backend))
            })
            .await
    }

    pub fn get_instance() -> Result<&'static BudChat> {
        GLOBAL_BUDCHAT.get().ok_or_else(|| {
            BudChatError::Configuration("BudChat has not been initialized".to_string())
        })
    }

    /// A standalone instance over caller-supplied capabilities.
    pub fn with_capabilities(config: BudChatConfig, capabilities: Capabilities) -> Self {
        Self::from_parts(config, Backend::ready(capabilities))
    }

    /// A standalone instance whose backend becomes ready later.
    pub fn with_backend(config: BudChatConfig, backend: Backend) -> Self {
        Self::from_parts(config, backend)
    }

    fn from_parts(config: BudChatConfig, backend: Backend) -> Self {
        Self {
            config,
            backend,
            profiles: Arc::new(ProfileStore::new()),
        }
    }

    fn prepare_dirs(config: &BudChatConfig) -> Result<()> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", config.data_dir))
            .map_err(BudChatError::from)?;
        std::fs::create_dir_all(&config.logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", config.logs_dir))
            .map_err(BudChatError::from)?;

        init_tracing(&config.logs_dir);

        tracing::debug!(
            target: "budchat::prepare_dirs",
            "Logging initialized in directory: {:?}",
            config.logs_dir
        );
        Ok(())
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }
}
