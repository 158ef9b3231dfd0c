//! Wire protocols: how a record becomes a URL and a POST body.

use crate::config::{obfuscate, SiteConfig};
use crate::error::UploadResult;
use crate::mapping::{has_unique_targets, map_fields, FieldMapping, OWM_FIELD_MAP};
use crate::record::Record;
use crate::units::{to_canonical_metric, UnitConverter};
use serde_json::Value as JsonValue;
use url::Url;

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq)]
pub struct PostBody {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

/// URL and body builder for one remote API.
pub trait Protocol: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn format_url(&self, record: &Record) -> UploadResult<Url>;

    fn post_body(&self, record: &Record) -> UploadResult<PostBody>;

    /// The URL with credentials masked, for logs.
    fn redacted_url(&self, record: &Record) -> String {
        self.format_url(record)
            .map(|url| url.to_string())
            .unwrap_or_else(|err| format!("<invalid url: {err}>"))
    }
}

#[derive(Debug, Clone)]
pub struct OpenWeatherMap {
    appid: String,
    station_id: String,
    latitude: f64,
    longitude: f64,
    altitude: f64,
    server_url: Url,
    converter: UnitConverter,
    table: &'static [FieldMapping],
}

impl OpenWeatherMap {
    pub const NAME: &'static str = "OWM";
    pub const DEFAULT_SERVER_URL: &'static str = "http://api.openweathermap.org/data/3.0/measurements";

    pub fn new(site: &SiteConfig) -> Self {
        debug_assert!(has_unique_targets(OWM_FIELD_MAP));
        Self {
            appid: site.appid.clone(),
            station_id: site.station_id.clone(),
            latitude: site.latitude,
            longitude: site.longitude,
            altitude: site.altitude,
            server_url: site.server_url.clone(),
            converter: to_canonical_metric,
            table: OWM_FIELD_MAP,
        }
    }

    pub fn with_converter(mut self, converter: UnitConverter) -> Self {
        self.converter = converter;
        self
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Station location as (latitude, longitude, altitude in metres).
    pub fn location(&self) -> (f64, f64, f64) {
        (self.latitude, self.longitude, self.altitude)
    }

    /// The flat measurement object posted for `record`.
    pub fn measurement(&self, record: &Record) -> serde_json::Map<String, JsonValue> {
        let canonical = (self.converter)(record);
        let mut values = map_fields(self.table, &canonical);
        values.insert(
            "station_id".to_string(),
            JsonValue::String(self.station_id.clone()),
        );
        values
    }

    fn url_with_appid(&self, appid: &str) -> Url {
        let mut url = self.server_url.clone();
        url.query_pairs_mut().append_pair("appid", appid);
        url
    }
}

impl Protocol for OpenWeatherMap {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn format_url(&self, _record: &Record) -> UploadResult<Url> {
        Ok(self.url_with_appid(&self.appid))
    }

    fn post_body(&self, record: &Record) -> UploadResult<PostBody> {
        // The measurements endpoint takes a list, even for a single station.
        let payload = JsonValue::Array(vec![JsonValue::Object(self.measurement(record))]);
        Ok(PostBody {
            body: serde_json::to_vec(&payload)?,
            content_type: JSON_CONTENT_TYPE,
        })
    }

    fn redacted_url(&self, _record: &Record) -> String {
        self.url_with_appid(&obfuscate(&self.appid)).to_string()
    }
}
