use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    errors::Error,
    module::ModuleConfig,
    state::StoreOptions,
    supervisor::SupervisorConfig,
    token::{TokenSourceConfig, DEFAULT_REFRESH_BUFFER},
    Result,
};

/// Process configuration: env vars (optionally from `.env`) plus the JSON
/// module file they point at.
#[derive(Clone, Debug)]
pub struct Config {
    pub telegram_bot_token: String,

    // Files
    pub config_file: PathBuf,
    pub state_file: PathBuf,
    pub tokens_dir: PathBuf,

    // Timing
    pub state_debounce: Duration,
    pub token_refresh_buffer: Duration,
    pub http_timeout: Duration,

    pub file: FileConfig,
}

/// One `credentials` entry of the config file.
#[derive(Clone, Debug, Deserialize)]
pub struct CredentialConfig {
    pub client_id: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct RawFileConfig {
    #[serde(default)]
    credentials: BTreeMap<String, CredentialConfig>,
    #[serde(default)]
    modules: Vec<ModuleConfig>,
}

/// Parsed config file with token file paths resolved.
#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    pub credentials: BTreeMap<String, TokenSourceConfig>,
    pub modules: Vec<ModuleConfig>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_vars(env_str)
    }

    /// Build from a variable lookup; `load` passes the process environment.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let telegram_bot_token = var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let config_file = PathBuf::from(var("RELAY_CONFIG").unwrap_or("./config.json".to_string()));
        let state_file = PathBuf::from(var("STATE_FILE").unwrap_or("./state.json".to_string()));
        let tokens_dir = PathBuf::from(var("TOKENS_DIR").unwrap_or("./tokens".to_string()));

        let state_debounce =
            Duration::from_millis(parse_u64(var("STATE_DEBOUNCE_MS")).unwrap_or(5_000));
        let token_refresh_buffer = parse_u64(var("TOKEN_REFRESH_BUFFER_SECS"))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REFRESH_BUFFER);
        let http_timeout = Duration::from_secs(parse_u64(var("HTTP_TIMEOUT_SECS")).unwrap_or(15));

        let text = fs::read_to_string(&config_file).map_err(|e| {
            Error::Config(format!(
                "cannot read config file {}: {e}",
                config_file.display()
            ))
        })?;
        let file = parse_file_config(&text, &tokens_dir)?;

        Ok(Self {
            telegram_bot_token,
            config_file,
            state_file,
            tokens_dir,
            state_debounce,
            token_refresh_buffer,
            http_timeout,
            file,
        })
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            state_file: self.state_file.clone(),
            store_options: StoreOptions {
                debounce: self.state_debounce,
                ..StoreOptions::default()
            },
            refresh_buffer: self.token_refresh_buffer,
            credentials: self.file.credentials.clone(),
            modules: self.file.modules.clone(),
        }
    }
}

/// Parse the JSON module file. Credentials without `token_file` live in
/// `<tokens_dir>/<key>.json`.
pub fn parse_file_config(text: &str, tokens_dir: &Path) -> Result<FileConfig> {
    let raw: RawFileConfig = serde_json::from_str(text)
        .map_err(|e| Error::Config(format!("invalid config file: {e}")))?;

    let credentials = raw
        .credentials
        .into_iter()
        .map(|(key, c)| {
            let backing_file = c
                .token_file
                .unwrap_or_else(|| tokens_dir.join(format!("{key}.json")));
            (
                key,
                TokenSourceConfig {
                    client_id: c.client_id,
                    token_endpoint: c.token_endpoint,
                    backing_file,
                },
            )
        })
        .collect();

    Ok(FileConfig {
        credentials,
        modules: raw.modules,
    })
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn parse_u64(v: Option<String>) -> Option<u64> {
    v.and_then(|s| s.trim().parse::<u64>().ok())
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}
