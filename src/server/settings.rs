use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;

use crate::server::registry::OrgRegistry;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub token: TokenSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// When set, `GET /` answers with a permanent redirect to this URL
    #[serde(default)]
    pub root_redirect_url: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            root_redirect_url: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Forward the inbound `Authorization` header upstream and use its Basic
    /// credentials for token lookups (default: true)
    #[serde(default = "default_true")]
    pub forward_client_credentials: bool,

    /// Append the inbound query string to the upstream URL (default: true)
    #[serde(default = "default_true")]
    pub forward_query_string: bool,

    /// TCP connect timeout for upstream registries (default: 30)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time allowed until upstream response headers arrive (default: 300)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Longest pause tolerated while streaming an upstream body (default: 300)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Largest inbound request body accepted; bigger ones get 413
    /// (default: 32 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            forward_client_credentials: true,
            forward_query_string: true,
            connect_timeout_secs: default_connect_timeout(),
            response_timeout_secs: default_response_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_response_timeout() -> u64 {
    300
}

fn default_read_timeout() -> u64 {
    300
}

fn default_max_body_bytes() -> u64 {
    32 * 1024 * 1024
}

/// How token caches are shared between inbound requests
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// One process-wide cache shared by all requests
    #[default]
    Shared,
    /// A fresh cache for every inbound request; tokens are never reused
    PerRequest,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenSettings {
    /// Timeout for the realm token request (default: 30)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default)]
    pub cache_mode: CacheMode,

    /// Attach client Basic credentials to the realm request (default: false)
    ///
    /// Off by default: tokens are requested anonymously even when the client
    /// supplied credentials.
    #[serde(default)]
    pub send_basic_auth: bool,

    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: u64,

    /// Interval between cache maintenance sweeps (default: 60)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            cache_mode: CacheMode::default(),
            send_basic_auth: false,
            max_cache_entries: default_max_cache_entries(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_max_cache_entries() -> u64 {
    10_000
}

fn default_sweep_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegistrySettings {
    /// Additional org aliases, e.g. `ecr: https://public.ecr.aws`
    #[serde(default)]
    pub extra_orgs: HashMap<String, String>,
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        let re = match regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
            Ok(re) => re,
            Err(_) => return s.to_string(),
        };

        re.replace_all(s, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match env::var(var_name) {
                Ok(val) => val,
                Err(_) => default_value.unwrap_or("").to_string(),
            }
        })
        .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => i64::try_from(*i)
                .map(serde_json::Value::from)
                .or_else(|_| u64::try_from(*i).map(serde_json::Value::from))
                .unwrap_or(serde_json::Value::Null),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => u64::try_from(*u)
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Add `<config_dir>/<name>.{toml,yaml,yml}` if one exists
    fn try_add_config_file(
        builder: &mut config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &str,
        name: &str,
    ) -> bool {
        for ext in ["toml", "yaml", "yml"] {
            let path = format!("{}/{}.{}", config_dir, name, ext);
            if std::path::Path::new(&path).exists() {
                tracing::info!("Loading config file: {}", path);
                *builder = builder
                    .clone()
                    .add_source(config::File::with_name(&format!("{}/{}", config_dir, name)));
                return true;
            }
        }

        tracing::debug!(
            "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
            config_dir,
            name
        );
        false
    }

    /// Load settings using `MIRROR_CONFIG_DIR` and `MIRROR_CONFIG_RUN_MODE`
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("MIRROR_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("MIRROR_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load(&config_dir, &run_mode)
    }

    /// Load settings from `config_dir`
    ///
    /// Sources, later ones winning: `default`, `<run_mode>` and `local` config
    /// files (all optional), then `MIRROR__SECTION__KEY` environment
    /// variables, then `PORT`.
    pub fn load(config_dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        Self::try_add_config_file(&mut builder, config_dir, "default");
        Self::try_add_config_file(&mut builder, config_dir, run_mode);
        Self::try_add_config_file(&mut builder, config_dir, "local");

        builder = builder.add_source(
            Environment::with_prefix("MIRROR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        let mut unused_fields = Vec::new();
        let mut settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        // PORT is the conventional way container platforms assign a port
        if let Ok(port) = env::var("PORT") {
            if !port.is_empty() {
                settings.server.port = port.parse().map_err(|_| {
                    ConfigError::Message(format!("PORT must be a valid port number, got '{}'", port))
                })?;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("proxy.connect_timeout_secs", self.proxy.connect_timeout_secs),
            ("proxy.response_timeout_secs", self.proxy.response_timeout_secs),
            ("proxy.read_timeout_secs", self.proxy.read_timeout_secs),
            ("proxy.max_body_bytes", self.proxy.max_body_bytes),
            ("token.fetch_timeout_secs", self.token.fetch_timeout_secs),
            ("token.max_cache_entries", self.token.max_cache_entries),
            ("token.sweep_interval_secs", self.token.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Message(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.token.fetch_timeout_secs > self.proxy.response_timeout_secs {
            return Err(ConfigError::Message(format!(
                "token.fetch_timeout_secs ({}) must not exceed proxy.response_timeout_secs ({})",
                self.token.fetch_timeout_secs, self.proxy.response_timeout_secs
            )));
        }

        if let Some(ref redirect) = self.server.root_redirect_url {
            url::Url::parse(redirect).map_err(|e| {
                ConfigError::Message(format!(
                    "server.root_redirect_url '{}' is not a valid URL: {}",
                    redirect, e
                ))
            })?;
        }

        let mut seen = HashSet::new();
        for (alias, upstream) in &self.registry.extra_orgs {
            Self::validate_org(alias, upstream)?;
            if !seen.insert(alias.to_lowercase()) {
                return Err(ConfigError::Message(format!(
                    "registry.extra_orgs alias '{}' is configured more than once (aliases are case-insensitive)",
                    alias
                )));
            }
        }

        Ok(())
    }

    fn validate_org(alias: &str, upstream: &str) -> Result<(), ConfigError> {
        if alias.is_empty() || alias.contains('/') {
            return Err(ConfigError::Message(format!(
                "registry.extra_orgs alias '{}' must be a non-empty path segment",
                alias
            )));
        }

        if OrgRegistry::is_builtin(&alias.to_lowercase()) {
            return Err(ConfigError::Message(format!(
                "registry.extra_orgs alias '{}' shadows a built-in alias",
                alias
            )));
        }

        let parsed = url::Url::parse(upstream).map_err(|e| {
            ConfigError::Message(format!(
                "registry.extra_orgs.{} upstream '{}' is not a valid URL: {}",
                alias, upstream, e
            ))
        })?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ConfigError::Message(format!(
                "registry.extra_orgs.{} upstream '{}' must use http or https",
                alias, upstream
            )));
        }

        Ok(())
    }

    /// Org registry with the built-in aliases plus configured ones
    pub fn org_registry(&self) -> OrgRegistry {
        OrgRegistry::default().with_extra_orgs(&self.registry.extra_orgs)
    }
}
