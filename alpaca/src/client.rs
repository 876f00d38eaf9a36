//! Alpaca HTTP Client

use crate::{AlpacaDevice, ALPACA_API_VERSION};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use telescope_conform::{DeviceError, ErrorKind};
use thiserror::Error;
use tracing::{debug, trace};

/// Client ID for Alpaca API calls (thread-safe)
static CLIENT_ID: AtomicU32 = AtomicU32::new(1);
static TRANSACTION_ID: AtomicU32 = AtomicU32::new(0);

/// Alpaca-specific error types
#[derive(Debug, Error)]
pub enum AlpacaError {
    #[error("Connection timeout after {duration_ms}ms during {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Connection refused: {url} - {cause}")]
    ConnectionRefused { url: String, cause: String },

    #[error("HTTP error {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("Device error {code}: {message}")]
    DeviceError { code: i32, message: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
}

impl AlpacaError {
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        AlpacaError::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    pub fn connection_refused(url: impl Into<String>, cause: impl Into<String>) -> Self {
        AlpacaError::ConnectionRefused {
            url: url.into(),
            cause: cause.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            AlpacaError::Timeout { .. } => true,
            AlpacaError::ConnectionRefused { .. } => true,
            AlpacaError::HttpError { status, .. } => *status >= 500 || *status == 429,
            AlpacaError::RequestFailed(_) => true,
            AlpacaError::DeviceError { .. } => false,
            AlpacaError::ParseError(_) => false,
            AlpacaError::RetryExhausted { .. } => false,
        }
    }
}

impl From<reqwest::Error> for AlpacaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AlpacaError::Timeout {
                operation: err
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|| "HTTP request".to_string()),
                duration_ms: 0,
            }
        } else if err.is_connect() {
            let url = err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            AlpacaError::ConnectionRefused {
                url,
                cause: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            AlpacaError::HttpError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            AlpacaError::ParseError(err.to_string())
        } else {
            AlpacaError::RequestFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AlpacaError {
    fn from(err: serde_json::Error) -> Self {
        AlpacaError::ParseError(err.to_string())
    }
}

/// Device errors keep their ASCOM number; transport failures become `Other`
impl From<AlpacaError> for DeviceError {
    fn from(err: AlpacaError) -> Self {
        match err {
            AlpacaError::DeviceError { code, message } => DeviceError::from_code(code, message),
            AlpacaError::HttpError { status: 400, message } => DeviceError::new(ErrorKind::InvalidValue, message),
            other => DeviceError::other(other.to_string()),
        }
    }
}

pub fn get_client_transaction() -> (u32, u32) {
    let client_id = CLIENT_ID.load(Ordering::SeqCst);
    let transaction_id = TRANSACTION_ID.fetch_add(1, Ordering::SeqCst);
    (client_id, transaction_id)
}

pub fn get_client_id() -> u32 {
    CLIENT_ID.load(Ordering::SeqCst)
}

pub fn set_client_id(id: u32) {
    CLIENT_ID.store(id, Ordering::SeqCst);
}

/// Timeout configuration for different operation types
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Property reads and short writes
    pub standard_operation_ms: u64,
    /// Synchronous slews, Park and FindHome, which only return once finished
    pub long_operation_ms: u64,
    pub connect_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            standard_operation_ms: 30000,
            long_operation_ms: 300000,
            connect_ms: 10000,
        }
    }
}

impl TimeoutConfig {
    /// Long operations get the slew budget plus headroom for the HTTP round trip
    pub fn for_slew_budget(maximum_slew_secs: u64) -> Self {
        Self {
            long_operation_ms: (maximum_slew_secs + 30) * 1000,
            ..Default::default()
        }
    }
}

/// Retry configuration for failed reads
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles the delay each time)
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.use_jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand_simple() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Cheap jitter source in 0.0..1.0
fn rand_simple() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as f64 / u32::MAX as f64).fract()
}

/// Alpaca API response wrapper.
///
/// Servers omit `Value` on errors and on most PUT responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase", bound(deserialize = "T: Deserialize<'de>"))]
pub struct AlpacaResponse<T> {
    #[serde(default)]
    pub value: Option<T>,
    #[serde(default)]
    pub client_transaction_id: u32,
    #[serde(default)]
    pub server_transaction_id: u32,
    #[serde(default)]
    pub error_number: i32,
    #[serde(default)]
    pub error_message: String,
}

impl<T> AlpacaResponse<T> {
    /// Surface a non-zero ErrorNumber as an error, otherwise hand back the value
    pub fn into_result(self) -> Result<Option<T>, AlpacaError> {
        if self.error_number != 0 {
            return Err(AlpacaError::DeviceError {
                code: self.error_number,
                message: self.error_message,
            });
        }
        Ok(self.value)
    }
}

/// Alpaca client for one telescope on one server
pub struct AlpacaClient {
    http_client: Client,
    long_client: Client,
    device: AlpacaDevice,
    timeout_config: TimeoutConfig,
    retry_config: RetryConfig,
}

impl AlpacaClient {
    pub fn new(device: AlpacaDevice) -> Result<Self, AlpacaError> {
        Self::with_config(device, TimeoutConfig::default(), RetryConfig::default())
    }

    pub fn with_config(
        device: AlpacaDevice,
        timeout_config: TimeoutConfig,
        retry_config: RetryConfig,
    ) -> Result<Self, AlpacaError> {
        let http_client = Self::build_http_client(timeout_config.standard_operation_ms, timeout_config.connect_ms)?;
        let long_client = Self::build_http_client(timeout_config.long_operation_ms, timeout_config.connect_ms)?;

        Ok(Self {
            http_client,
            long_client,
            device,
            timeout_config,
            retry_config,
        })
    }

    fn build_http_client(timeout_ms: u64, connect_ms: u64) -> Result<Client, AlpacaError> {
        Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .connect_timeout(Duration::from_millis(connect_ms))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AlpacaError::RequestFailed(e.to_string()))
    }

    pub fn device(&self) -> &AlpacaDevice {
        &self.device
    }

    pub fn timeout_config(&self) -> &TimeoutConfig {
        &self.timeout_config
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    /// Build the URL for an API endpoint
    pub fn build_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/v{}/telescope/{}/{}",
            self.device.base_url.trim_end_matches('/'),
            ALPACA_API_VERSION,
            self.device.device_number,
            endpoint
        )
    }

    /// Run a request, retrying transport failures with backoff
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, AlpacaError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, AlpacaError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retry_config.max_attempts {
                        if attempt == 1 {
                            return Err(e);
                        }
                        return Err(AlpacaError::RetryExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.retry_config.delay_for_attempt(attempt - 1);
                    debug!(
                        "Request failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, self.retry_config.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<Option<T>, AlpacaError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AlpacaError::HttpError {
                status: status.as_u16(),
                message: body,
            });
        }
        let alpaca_response: AlpacaResponse<T> = response.json().await?;
        alpaca_response.into_result()
    }

    /// GET a property, with optional query parameters for indexed members
    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str, params: &[(&str, String)]) -> Result<T, AlpacaError> {
        self.execute_with_retry(|| async move {
            let (client_id, transaction_id) = get_client_transaction();
            let url = self.build_url(endpoint);
            trace!("GET {} {:?}", url, params);

            let mut query: Vec<(&str, String)> = vec![
                ("ClientID", client_id.to_string()),
                ("ClientTransactionID", transaction_id.to_string()),
            ];
            query.extend(params.iter().cloned());

            let response = self.http_client.get(&url).query(&query).send().await?;
            Self::decode::<T>(response)
                .await?
                .ok_or_else(|| AlpacaError::ParseError(format!("{} returned no Value", endpoint)))
        })
        .await
    }

    /// PUT a command or property write.
    ///
    /// Never retried: a repeated slew or park is not harmless.
    pub async fn put(&self, endpoint: &str, params: &[(&str, String)]) -> Result<(), AlpacaError> {
        self.put_with(&self.http_client, endpoint, params).await
    }

    /// PUT for members that only return once the motion has finished
    pub async fn put_long(&self, endpoint: &str, params: &[(&str, String)]) -> Result<(), AlpacaError> {
        self.put_with(&self.long_client, endpoint, params).await
    }

    async fn put_with(&self, client: &Client, endpoint: &str, params: &[(&str, String)]) -> Result<(), AlpacaError> {
        let (client_id, transaction_id) = get_client_transaction();
        let url = self.build_url(endpoint);
        trace!("PUT {} {:?}", url, params);

        let mut form: Vec<(&str, String)> = vec![
            ("ClientID", client_id.to_string()),
            ("ClientTransactionID", transaction_id.to_string()),
        ];
        form.extend(params.iter().cloned());

        let response = client.put(&url).form(&form).send().await?;
        Self::decode::<serde_json::Value>(response).await.map(drop)
    }

    pub async fn connect(&self) -> Result<(), AlpacaError> {
        self.put("connected", &[("Connected", "true".to_string())]).await
    }

    pub async fn disconnect(&self) -> Result<(), AlpacaError> {
        self.put("connected", &[("Connected", "false".to_string())]).await
    }

    pub async fn is_connected(&self) -> Result<bool, AlpacaError> {
        self.get("connected", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn client() -> AlpacaClient {
        AlpacaClient::new(AlpacaDevice::new("http://localhost:11111/", 2)).unwrap()
    }

    #[test]
    fn test_transaction_id_uniqueness_single_thread() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let (_, tid) = get_client_transaction();
            assert!(ids.insert(tid), "Transaction ID {} was not unique", tid);
        }
    }

    #[test]
    fn test_build_url() {
        assert_eq!(
            client().build_url("canmoveaxis"),
            "http://localhost:11111/api/v1/telescope/2/canmoveaxis"
        );
    }

    #[test]
    fn test_response_with_error_number_is_device_error() {
        let json = r#"{"ClientTransactionID":3,"ServerTransactionID":9,"ErrorNumber":1032,"ErrorMessage":"Parked"}"#;
        let response: AlpacaResponse<f64> = serde_json::from_str(json).unwrap();
        let error = response.into_result().unwrap_err();

        let device_error = DeviceError::from(error);
        assert_eq!(device_error.kind, ErrorKind::InvalidWhileParked);
        assert_eq!(device_error.code, Some(0x408));
        assert_eq!(device_error.message, "Parked");
    }

    #[test]
    fn test_response_value_is_optional() {
        let json = r#"{"ErrorNumber":0,"ErrorMessage":""}"#;
        let response: AlpacaResponse<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert!(response.into_result().unwrap().is_none());

        let json = r#"{"Value":12.5,"ErrorNumber":0,"ErrorMessage":""}"#;
        let response: AlpacaResponse<f64> = serde_json::from_str(json).unwrap();
        assert_eq!(response.into_result().unwrap(), Some(12.5));
    }

    #[test]
    fn test_transport_errors_map_to_other() {
        let error = DeviceError::from(AlpacaError::timeout("slewtocoordinates", 5000));
        assert_eq!(error.kind, ErrorKind::Other);
        assert!(error.message.contains("slewtocoordinates"));

        let error = DeviceError::from(AlpacaError::HttpError {
            status: 400,
            message: "Rate out of range".to_string(),
        });
        assert_eq!(error.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 500,
            backoff_multiplier: 2.0,
            use_jitter: false,
        };
        assert_eq!(config.delay_for_attempt(0).as_millis(), 100);
        assert_eq!(config.delay_for_attempt(1).as_millis(), 200);
        assert_eq!(config.delay_for_attempt(2).as_millis(), 400);
        assert_eq!(config.delay_for_attempt(3).as_millis(), 500);
    }

    #[test]
    fn test_alpaca_error_is_retryable() {
        assert!(AlpacaError::timeout("test", 5000).is_retryable());
        assert!(AlpacaError::connection_refused("http://localhost", "refused").is_retryable());
        assert!(AlpacaError::HttpError { status: 503, message: String::new() }.is_retryable());

        assert!(!AlpacaError::DeviceError { code: 0x400, message: String::new() }.is_retryable());
        assert!(!AlpacaError::HttpError { status: 400, message: String::new() }.is_retryable());
        assert!(!AlpacaError::ParseError("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_slew_budget_timeout() {
        let config = TimeoutConfig::for_slew_budget(300);
        assert_eq!(config.long_operation_ms, 330_000);
        assert_eq!(config.standard_operation_ms, 30000);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let client = AlpacaClient::with_config(
            AlpacaDevice::new("http://127.0.0.1:9", 0),
            TimeoutConfig {
                standard_operation_ms: 1000,
                long_operation_ms: 1000,
                connect_ms: 500,
            },
            RetryConfig::no_retry(),
        )
        .unwrap();

        let error = client.is_connected().await.unwrap_err();
        assert!(error.is_retryable(), "{}", error);
    }
}
