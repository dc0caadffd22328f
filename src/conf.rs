use std::{
    env,
    fmt::Debug,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::Context;

pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_API_BASE: &str = "OPENAI_API_BASE";

pub static GLOBAL: LazyLock<Arc<Conf>> = LazyLock::new(|| {
    let conf = read_or_create_default().unwrap_or_else(|error| {
        panic!("Failed to initialize global config: {error:?}")
    });
    Arc::new(conf)
});

#[must_use]
pub fn global() -> Arc<Conf> {
    (*GLOBAL).clone()
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Conf {
    #[serde(
        serialize_with = "serialize_log_level",
        deserialize_with = "deserialize_log_level"
    )]
    pub log_level: tracing::Level,
    pub addr: IpAddr,
    pub port: u16,
    pub data_file: PathBuf,
    pub sqlite_busy_timeout: f32,
    pub upstream: ConfUpstream,
    pub tls: Option<Tls>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: tracing::Level::INFO,
            addr: "127.0.0.1".parse().unwrap_or_else(|_| {
                unreachable!("Fat-fingered default IP address!")
            }),
            port: 3001,
            data_file: PathBuf::from("data/data.db"),
            sqlite_busy_timeout: 60.0,
            upstream: ConfUpstream::default(),
            tls: None,
        }
    }
}

impl Conf {
    /// Credentials found in the process environment win over the file.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(api_key) = non_empty_env(ENV_API_KEY) {
            self.upstream.api_key = Some(api_key);
        }
        if let Some(api_base) = non_empty_env(ENV_API_BASE) {
            self.upstream.api_base = Some(api_base);
        }
        self
    }

    pub fn sqlite_busy_timeout(&self) -> anyhow::Result<Duration> {
        let secs = self.sqlite_busy_timeout;
        Duration::try_from_secs_f32(secs)
            .context(format!("Invalid sqlite_busy_timeout: {secs}"))
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct Tls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Where image generation requests are forwarded to.
///
/// Both `api_key` and `api_base` are optional here: their absence is only an
/// error for the request that needs them, not for server startup.
#[derive(serde::Serialize, serde::Deserialize, Clone, Default)]
#[serde(default)]
pub struct ConfUpstream {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    /// Seconds. No timeout when absent.
    pub timeout: Option<f32>,
}

impl ConfUpstream {
    /// Zero or negative means no timeout.
    pub fn timeout(&self) -> anyhow::Result<Option<Duration>> {
        match self.timeout {
            Some(secs) if secs.is_nan() || secs > 0.0 => {
                let timeout = Duration::try_from_secs_f32(secs)
                    .context(format!("Invalid upstream.timeout: {secs}"))?;
                Ok(Some(timeout))
            }
            _ => Ok(None),
        }
    }
}

impl Debug for ConfUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfUpstream")
            .field("api_key", &self.api_key.as_ref().map(|_| "<XXXXX>"))
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn serialize_log_level<S>(
    level: &tracing::Level,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let s = level.to_string();
    serializer.serialize_str(&s)
}

fn deserialize_log_level<'de, D>(
    deserializer: D,
) -> Result<tracing::Level, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    let s = String::deserialize(deserializer)?;
    tracing::Level::from_str(&s).map_err(serde::de::Error::custom)
}

pub fn read_or_create_default() -> anyhow::Result<Conf> {
    let path = "conf/conf.toml";
    let conf = read_or_create_default_(path).context(path)?;
    Ok(conf.with_env_overrides())
}

pub fn read_or_create_default_<P: AsRef<Path>>(
    path: P,
) -> anyhow::Result<Conf> {
    let path = path.as_ref();
    let conf = if fs::exists(path)? {
        let s = fs::read_to_string(path)?;
        toml::from_str(&s)?
    } else {
        if let Some(parent) = path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for conf file: {path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let conf = Conf::default();
        let s = toml::to_string_pretty(&conf)?;
        fs::write(path, s)?;
        conf
    };
    Ok(conf)
}
