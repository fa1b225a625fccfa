use std::time::Instant;

use log::{debug, info};
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, USER_AGENT};
use reqwest::{Client, Error as ReqwestError, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::crypto::PublicKey;

static BASE_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.5"));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/92.0.4515.159 Safari/537.36"));
    headers
});

/// Response shape of the save endpoint: `e` is a numeric code, `m` free text.
#[derive(Debug, Deserialize)]
pub struct SaveResponse {
    pub e: i64,
    #[serde(default)]
    pub m: String,
}

#[derive(Debug)]
pub enum NetworkError {
    Reqwest(ReqwestError),
    ApiError { status: StatusCode, message: String },
    SerdeJsonError(serde_json::Error),
}

impl From<ReqwestError> for NetworkError {
    fn from(err: ReqwestError) -> NetworkError {
        NetworkError::Reqwest(err)
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> NetworkError {
        NetworkError::SerdeJsonError(err)
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::Reqwest(e) => write!(f, "HTTP request error: {}", e),
            NetworkError::ApiError { status, message } => write!(f, "API error ({}): {}", status, message),
            NetworkError::SerdeJsonError(e) => write!(f, "JSON deserialization error: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {}

/// Builds a fresh session: browser-like headers plus an empty cookie jar.
/// Each trial gets its own; a rejected submission may invalidate the
/// server-side session, so sessions are never reused across trials.
pub fn build_session() -> Result<Client, NetworkError> {
    let client = Client::builder()
        .default_headers(BASE_HEADERS.clone())
        .cookie_provider(std::sync::Arc::new(reqwest::cookie::Jar::default()))
        .build()?;
    Ok(client)
}

/// GETs a page on the session and returns its body as text.
pub async fn fetch_page(client: &Client, url: &str) -> Result<String, NetworkError> {
    let start_time = Instant::now();
    let response = client.get(url).send().await?;
    info!("[TIMING] fetch_page for {} took {:.2?}", url, start_time.elapsed());

    if !response.status().is_success() {
        return Err(NetworkError::ApiError {
            status: response.status(),
            message: format!("Failed to fetch page: {}", url),
        });
    }
    Ok(response.text().await?)
}

/// GETs the CAS public key endpoint.
pub async fn fetch_public_key(client: &Client, url: &str) -> Result<PublicKey, NetworkError> {
    let start_time = Instant::now();
    let response = client.get(url).send().await?;
    info!("[TIMING] fetch_public_key took {:.2?}", start_time.elapsed());

    if !response.status().is_success() {
        return Err(NetworkError::ApiError {
            status: response.status(),
            message: format!("Failed to fetch public key from {}", url),
        });
    }
    let body = response.text().await?;
    debug!("[API] getPubKey response body: {}", body);
    let key: PublicKey = serde_json::from_str(&body)?;
    Ok(key)
}

/// POSTs the encrypted credentials to the CAS login endpoint and returns the
/// response body for branding inspection. The session's cookie jar picks up
/// the authentication cookies as a side effect.
pub async fn post_credentials(
    client: &Client,
    login_url: &str,
    identifier: &str,
    encrypted_secret: &str,
    execution: &str,
) -> Result<String, NetworkError> {
    let params = [
        ("username", identifier),
        ("password", encrypted_secret),
        ("execution", execution),
        ("_eventId", "submit"),
    ];

    let start_time = Instant::now();
    let response = client.post(login_url).form(&params).send().await?;
    info!("[TIMING] post_credentials took {:.2?}", start_time.elapsed());

    if !response.status().is_success() {
        return Err(NetworkError::ApiError {
            status: response.status(),
            message: "Login POST rejected by the gateway".to_string(),
        });
    }
    Ok(response.text().await?)
}

/// GETs the challenge image as raw bytes.
pub async fn fetch_captcha_image(client: &Client, url: &str) -> Result<Vec<u8>, NetworkError> {
    let start_time = Instant::now();
    let response = client.get(url).send().await?;
    info!("[TIMING] fetch_captcha_image took {:.2?}", start_time.elapsed());

    if !response.status().is_success() {
        return Err(NetworkError::ApiError {
            status: response.status(),
            message: format!("Failed to fetch captcha image from {}", url),
        });
    }
    Ok(response.bytes().await?.to_vec())
}

/// POSTs the derived payload form-encoded to the save endpoint and parses
/// the `{e, m}` response.
pub async fn post_report(
    client: &Client,
    save_url: &str,
    payload: &Map<String, Value>,
) -> Result<SaveResponse, NetworkError> {
    let form: Vec<(&str, String)> = payload
        .iter()
        .map(|(k, v)| (k.as_str(), form_value(v)))
        .collect();
    debug!("[API] save form params: {:?}", form);

    let start_time = Instant::now();
    let response = client.post(save_url).form(&form).send().await?;
    info!("[TIMING] post_report took {:.2?}", start_time.elapsed());

    if !response.status().is_success() {
        return Err(NetworkError::ApiError {
            status: response.status(),
            message: format!("Save endpoint returned {}", response.status()),
        });
    }
    let body = response.text().await?;
    debug!("[API] save response body: {}", body);
    let parsed: SaveResponse = serde_json::from_str(&body)?;
    Ok(parsed)
}

/// Renders a JSON value the way a browser form would: strings bare, numbers
/// and everything else via their JSON rendering.
fn form_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
