use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(100);
    pub const MAX_BACKOFF: Duration = Duration::from_millis(800);
    pub const JITTER: Duration = Duration::from_millis(50);
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: ApiDefaults::MAX_ATTEMPTS,
                initial_backoff: ApiDefaults::BACKOFF,
                max_backoff: ApiDefaults::MAX_BACKOFF,
                jitter: ApiDefaults::JITTER,
            },
        }
    }
}

/// Bearer-authenticated client for the platform REST endpoints.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    token: SecretString,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(base_url: &str, token: SecretString) -> Result<Self, ApiError> {
        Self::with_options(base_url, token, ApiClientOptions::default())
    }

    pub fn with_options(
        base_url: &str,
        token: SecretString,
        options: ApiClientOptions,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|err| ApiError::InvalidBaseUrl(err.to_string()))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ApiError::InvalidBaseUrl(format!(
                "unsupported scheme {}",
                base_url.scheme()
            )));
        }

        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url,
            token,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Profile of the authenticated user, including permitted devices.
    pub async fn me(&self) -> Result<UserProfile, ApiError> {
        self.get_json("/api/me", &[]).await
    }

    /// Latest summary of every device the user may read.
    pub async fn devices(&self) -> Result<Vec<DeviceSummary>, ApiError> {
        self.get_json("/api/devices", &[]).await
    }

    pub async fn device(&self, device_id: &str) -> Result<DeviceSummary, ApiError> {
        self.get_json(&format!("/api/devices/{}", encode_segment(device_id)), &[])
            .await
    }

    /// Replaces the user's thresholds for a device.
    pub async fn update_thresholds(
        &self,
        device_id: &str,
        thresholds: &Thresholds,
    ) -> Result<ThresholdsUpdateResponse, ApiError> {
        let path = format!("/api/devices/{}/thresholds", encode_segment(device_id));
        let endpoint = self.endpoint(&path, &[]);
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    self.send_attempt(Method::PUT, endpoint, Some(thresholds))
                        .await
                }
            },
            ApiError::is_retryable,
        )
        .await
    }

    /// Alarm history of the authenticated user, newest first.
    pub async fn alarms(&self, query: &AlarmQuery) -> Result<AlarmPage, ApiError> {
        let mut params = Vec::new();
        if let Some(device_id) = query.device_id.as_deref() {
            params.push(("device_id", device_id));
        }
        if let Some(since) = query.since.as_deref() {
            params.push(("since", since));
        }
        if let Some(until) = query.until.as_deref() {
            params.push(("until", until));
        }
        self.get_json("/api/alarms", &params).await
    }

    /// Flips one LED of a device.
    ///
    /// Not retried: a repeated request would toggle the LED back.
    pub async fn toggle_led(
        &self,
        device_id: &str,
        color: LedColor,
    ) -> Result<LedToggleResponse, ApiError> {
        let path = format!(
            "/api/devices/{}/led/{}",
            encode_segment(device_id),
            color.as_path_segment()
        );
        let endpoint = self.endpoint(&path, &[]);

        retry_async(
            &RetryPolicy::single_attempt(),
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    self.send_attempt::<(), LedToggleResponse>(Method::POST, endpoint, None)
                        .await
                }
            },
            ApiError::is_retryable,
        )
        .await
    }

    async fn get_json<R>(&self, path: &str, query: &[(&str, &str)]) -> Result<R, ApiError>
    where
        R: DeserializeOwned,
    {
        let endpoint = self.endpoint(path, query);
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |_| {
                let endpoint = endpoint.clone();
                async move { self.send_attempt::<(), R>(Method::GET, endpoint, None).await }
            },
            ApiError::is_retryable,
        )
        .await
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Url {
        let mut url = self.base_url.clone();
        let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url.set_query(None);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter().copied());
        }
        url
    }

    async fn send_attempt<B, R>(
        &self,
        method: Method,
        endpoint: Url,
        body: Option<&B>,
    ) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut builder = self
            .http
            .request(method, endpoint)
            .timeout(self.attempt_timeout)
            .bearer_auth(self.token.expose_secret());

        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|err| ApiError::Parse(err.to_string()))
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DevicePermissions {
    pub read_data: bool,
    pub write_data: bool,
    pub led_red: bool,
    pub led_green: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub hum_min: Option<f64>,
    pub hum_max: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AllowedDevice {
    pub device_id: String,
    #[serde(default)]
    pub permissions: DevicePermissions,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub email: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub allowed_devices: Vec<AllowedDevice>,
}

impl UserProfile {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some("admin")
    }

    /// Devices the user may read, in profile order.
    pub fn readable_device_ids(&self) -> Vec<String> {
        self.allowed_devices
            .iter()
            .filter(|device| device.permissions.read_data)
            .map(|device| device.device_id.clone())
            .collect()
    }

    /// Devices whose thresholds the user may change.
    pub fn writable_devices(&self) -> impl Iterator<Item = &AllowedDevice> {
        self.allowed_devices
            .iter()
            .filter(|device| device.permissions.write_data)
    }

    /// Stored thresholds for a device; the server exposes them only here.
    pub fn thresholds_for(&self, device_id: &str) -> Option<&Thresholds> {
        self.allowed_devices
            .iter()
            .find(|device| device.device_id == device_id)
            .map(|device| &device.thresholds)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeviceSummary {
    pub device_id: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub last_update: Option<String>,
    /// Server-side connectivity label (`activo` / `desconectado`).
    #[serde(default, rename = "estado")]
    pub state: Option<String>,
    #[serde(default)]
    pub led_red: Option<bool>,
    #[serde(default)]
    pub led_green: Option<bool>,
    #[serde(default)]
    pub permissions: DevicePermissions,
}

impl DeviceSummary {
    pub fn is_active(&self) -> bool {
        self.state.as_deref() == Some("activo")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThresholdsUpdateResponse {
    #[serde(default)]
    pub msg: Option<String>,
    pub device_id: String,
    #[serde(default)]
    pub thresholds: Thresholds,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AlarmQuery {
    pub device_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AlarmRecord {
    #[serde(default)]
    pub alarm_id: Option<String>,
    pub device_id: String,
    #[serde(rename = "type")]
    pub alarm_type: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub threshold: Option<f64>,
    pub timestamp: String,
    #[serde(default)]
    pub sent_email: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AlarmPage {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub items: Vec<AlarmRecord>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LedColor {
    Red,
    Green,
}

impl LedColor {
    /// Path segment the server expects for this LED.
    pub fn as_path_segment(self) -> &'static str {
        match self {
            Self::Red => "rojo",
            Self::Green => "verde",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedToggleResponse {
    pub status: String,
    pub device_id: String,
    pub led: String,
    /// `on` or `off` after the toggle.
    pub action: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) | Self::InvalidBaseUrl(_) => false,
        }
    }
}

fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        match parsed.detail {
            Some(Value::String(detail)) => return detail,
            Some(detail) => return detail.to_string(),
            None => {}
        }
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
