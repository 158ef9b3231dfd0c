use crate::error::{UploadError, UploadResult};
use crate::protocol::OpenWeatherMap;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer};
use std::env;
use std::path::Path;
use std::time::Duration;
use url::Url;

const DEFAULT_HTTP_BIND: &str = "127.0.0.1:9102";
const SITE_ENV_PREFIX: &str = "OWM_";

/// Process-level configuration: the ingest endpoint, the host station, and one
/// option block per upload target.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: String,
    pub station: StationInfo,
    pub sites: Vec<SiteOptions>,
}

/// Location of the host station, used when a site leaves its own unset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StationInfo {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Metres.
    #[serde(default)]
    pub altitude: Option<f64>,
}

/// Raw per-target options as written by the operator. Every field may be unset;
/// [`SiteOptions::resolve`] applies defaults and validates.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SiteOptions {
    #[serde(default)]
    pub appid: Option<String>,
    #[serde(default)]
    pub station_id: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default, deserialize_with = "de_flex_bool")]
    pub skip_upload: Option<bool>,
    /// Seconds.
    #[serde(default)]
    pub post_interval: Option<u64>,
    #[serde(default)]
    pub max_backlog: Option<usize>,
    /// Seconds.
    #[serde(default)]
    pub stale: Option<u64>,
    #[serde(default, deserialize_with = "de_flex_bool")]
    pub log_success: Option<bool>,
    #[serde(default, deserialize_with = "de_flex_bool")]
    pub log_failure: Option<bool>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub max_tries: Option<u32>,
    /// Seconds.
    #[serde(default)]
    pub retry_wait: Option<u64>,
}

/// Validated, immutable configuration of one upload target.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub appid: String,
    pub station_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub server_url: Url,
    pub policy: PostPolicy,
}

/// Generic pacing, backlog, staleness and retry policy of a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PostPolicy {
    pub skip_upload: bool,
    pub post_interval: Option<Duration>,
    /// 0 keeps every drained record.
    pub max_backlog: usize,
    pub stale: Option<Duration>,
    pub log_success: bool,
    pub log_failure: bool,
    pub timeout: Duration,
    pub max_tries: u32,
    pub retry_wait: Duration,
}

impl Default for PostPolicy {
    fn default() -> Self {
        Self {
            skip_upload: false,
            post_interval: None,
            max_backlog: 0,
            stale: None,
            log_success: true,
            log_failure: true,
            timeout: Duration::from_secs(60),
            max_tries: 3,
            retry_wait: Duration::from_secs(5),
        }
    }
}

/// Contents of the JSON setup file.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub http_bind: Option<String>,
    #[serde(default)]
    pub station: StationInfo,
    #[serde(default)]
    pub sites: Vec<SiteOptions>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match env_optional("UPLOADER_CONFIG_PATH") {
            Some(path) => Some(load_config_file(Path::new(&path))?),
            None => None,
        };

        let env_station = StationInfo::from_env()?;
        let (file_bind, file_station, file_sites) = match file {
            Some(file) => (file.http_bind, file.station, file.sites),
            None => (None, StationInfo::default(), Vec::new()),
        };

        let http_bind = env_optional("UPLOADER_HTTP_BIND")
            .or(file_bind)
            .unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let station = env_station.or(file_station);

        let env_site = SiteOptions::from_env(SITE_ENV_PREFIX)?;
        let mut sites = file_sites;
        if env_site != SiteOptions::default() {
            sites.push(env_site);
        }

        Ok(Self {
            http_bind,
            station,
            sites,
        })
    }
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read uploader config {}", path.display()))?;
    let parsed: ConfigFile = serde_json::from_str(&raw)
        .with_context(|| format!("parse uploader config {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        sites = parsed.sites.len(),
        "loaded uploader config file"
    );
    Ok(parsed)
}

impl StationInfo {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            latitude: env_f64("STATION_LATITUDE")?,
            longitude: env_f64("STATION_LONGITUDE")?,
            altitude: env_f64("STATION_ALTITUDE_M")?,
        })
    }

    /// Field-wise fallback to `other`.
    pub fn or(self, other: StationInfo) -> StationInfo {
        StationInfo {
            latitude: self.latitude.or(other.latitude),
            longitude: self.longitude.or(other.longitude),
            altitude: self.altitude.or(other.altitude),
        }
    }
}

impl SiteOptions {
    /// Reads `<prefix>APPID`, `<prefix>STATION_ID`, ... from the environment.
    pub fn from_env(prefix: &str) -> Result<Self> {
        let key = |name: &str| format!("{prefix}{name}");
        Ok(Self {
            appid: env_optional(&key("APPID")),
            station_id: env_optional(&key("STATION_ID")),
            latitude: env_f64(&key("LATITUDE"))?,
            longitude: env_f64(&key("LONGITUDE"))?,
            altitude: env_f64(&key("ALTITUDE"))?,
            server_url: env_optional(&key("SERVER_URL")),
            skip_upload: env_bool(&key("SKIP_UPLOAD"))?,
            post_interval: env_u64(&key("POST_INTERVAL"))?,
            max_backlog: env_u64(&key("MAX_BACKLOG"))?.map(|v| v as usize),
            stale: env_u64(&key("STALE"))?,
            log_success: env_bool(&key("LOG_SUCCESS"))?,
            log_failure: env_bool(&key("LOG_FAILURE"))?,
            timeout: env_u64(&key("TIMEOUT"))?,
            max_tries: env_u64(&key("MAX_TRIES"))?.map(|v| v.min(u32::MAX as u64) as u32),
            retry_wait: env_u64(&key("RETRY_WAIT"))?,
        })
    }

    pub fn resolve(&self, station: &StationInfo) -> UploadResult<SiteConfig> {
        let appid = required(&self.appid, "appid")?;
        let station_id = required(&self.station_id, "station_id")?;

        let latitude = coordinate(self.latitude, station.latitude, "latitude")?;
        let longitude = coordinate(self.longitude, station.longitude, "longitude")?;
        let altitude = coordinate(self.altitude, station.altitude, "altitude")?;

        let raw_url = self
            .server_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(OpenWeatherMap::DEFAULT_SERVER_URL);
        let server_url = Url::parse(raw_url)
            .map_err(|err| UploadError::configuration(format!("invalid server_url {raw_url}: {err}")))?;
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(UploadError::configuration(format!(
                "server_url must be http(s), got {}",
                server_url.scheme()
            )));
        }

        let defaults = PostPolicy::default();
        let max_tries = match self.max_tries {
            Some(0) => {
                tracing::warn!(station_id = %station_id, "max_tries of 0 raised to 1");
                1
            }
            Some(tries) => tries,
            None => defaults.max_tries,
        };
        let policy = PostPolicy {
            skip_upload: self.skip_upload.unwrap_or(defaults.skip_upload),
            post_interval: nonzero_secs(self.post_interval),
            max_backlog: self.max_backlog.unwrap_or(defaults.max_backlog),
            stale: nonzero_secs(self.stale),
            log_success: self.log_success.unwrap_or(defaults.log_success),
            log_failure: self.log_failure.unwrap_or(defaults.log_failure),
            timeout: self
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_tries,
            retry_wait: self
                .retry_wait
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_wait),
        };

        Ok(SiteConfig {
            appid,
            station_id,
            latitude,
            longitude,
            altitude,
            server_url,
            policy,
        })
    }
}

fn required(value: &Option<String>, name: &str) -> UploadResult<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| UploadError::configuration(format!("missing option {name}")))
}

fn coordinate(site: Option<f64>, station: Option<f64>, name: &str) -> UploadResult<f64> {
    site.or(station).ok_or_else(|| {
        UploadError::configuration(format!("{name} unset for site and host station"))
    })
}

fn nonzero_secs(value: Option<u64>) -> Option<Duration> {
    value.filter(|secs| *secs > 0).map(Duration::from_secs)
}

/// Masks all but the last four characters of a credential.
pub fn obfuscate(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "X".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "X".repeat(chars.len() - 4), visible)
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" | "t" => Some(true),
        "0" | "false" | "no" | "off" | "n" | "f" => Some(false),
        _ => None,
    }
}

fn de_flex_bool<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FlexBool {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    match Option::<FlexBool>::deserialize(deserializer)? {
        None => Ok(None),
        Some(FlexBool::Bool(value)) => Ok(Some(value)),
        Some(FlexBool::Int(value)) => Ok(Some(value != 0)),
        Some(FlexBool::Str(raw)) => parse_bool(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid boolean {raw:?}"))),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    env_optional(key)
        .map(|raw| raw.parse::<u64>().with_context(|| format!("invalid {key}")))
        .transpose()
}

fn env_f64(key: &str) -> Result<Option<f64>> {
    env_optional(key)
        .map(|raw| raw.parse::<f64>().with_context(|| format!("invalid {key}")))
        .transpose()
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    env_optional(key)
        .map(|raw| parse_bool(&raw).ok_or_else(|| anyhow!("invalid {key}: {raw}")))
        .transpose()
}
