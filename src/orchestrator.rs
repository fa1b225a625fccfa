use chrono::Local;
use log::{debug, info, warn};
use serde_json::json;

use crate::captcha::{CaptchaError, Recognizer, TemplateRecognizer};
use crate::client::{self, NetworkError};
use crate::config::Config;
use crate::crypto::{self, CryptoError};
use crate::harvest::{self, ParseError};
use crate::outcome::{classify, Outcome};

/// Phases of one trial, in causal order. Terminal states are the returned
/// `Outcome` / `RunError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Authenticating,
    Harvesting,
    Resolving,
    Submitting,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Authenticating => write!(f, "AUTHENTICATING"),
            Phase::Harvesting => write!(f, "HARVESTING"),
            Phase::Resolving => write!(f, "RESOLVING"),
            Phase::Submitting => write!(f, "SUBMITTING"),
        }
    }
}

#[derive(Debug)]
pub enum RunError {
    Network(NetworkError),
    Parse(ParseError),
    Crypto(CryptoError),
    Captcha(CaptchaError),
    /// The gateway bounced the credentials back to the sign-in page.
    LoginRejected,
    /// The save endpoint returned a message we do not recognize.
    Server(String),
    /// Every trial ended in a retryable rejection.
    RetriesExhausted(u32),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Network(e) => write!(f, "network error: {}", e),
            RunError::Parse(e) => write!(f, "page parsing error: {}", e),
            RunError::Crypto(e) => write!(f, "password encryption error: {}", e),
            RunError::Captcha(e) => write!(f, "captcha error: {}", e),
            RunError::LoginRejected => write!(f, "login rejected, check account and password"),
            RunError::Server(m) => write!(f, "server rejected the submission: {}", m),
            RunError::RetriesExhausted(trials) => {
                write!(f, "retry budget exhausted after {} trials", trials)
            }
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Network(e) => Some(e),
            RunError::Parse(e) => Some(e),
            RunError::Crypto(e) => Some(e),
            RunError::Captcha(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NetworkError> for RunError {
    fn from(err: NetworkError) -> Self {
        RunError::Network(err)
    }
}

impl From<ParseError> for RunError {
    fn from(err: ParseError) -> Self {
        RunError::Parse(err)
    }
}

impl From<CryptoError> for RunError {
    fn from(err: CryptoError) -> Self {
        RunError::Crypto(err)
    }
}

impl From<CaptchaError> for RunError {
    fn from(err: CaptchaError) -> Self {
        RunError::Captcha(err)
    }
}

/// Drives the full authenticate-harvest-submit cycle with a bounded retry
/// loop. Every trial is independent: fresh session, fresh harvest, fresh
/// captcha; only the trial counter survives between trials.
pub struct Orchestrator {
    config: Config,
    recognizer: Box<dyn Recognizer>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Orchestrator {
            config,
            recognizer: Box::new(TemplateRecognizer),
        }
    }

    /// Swaps in a custom captcha recognizer (tests use stubs).
    pub fn with_recognizer(config: Config, recognizer: Box<dyn Recognizer>) -> Self {
        Orchestrator { config, recognizer }
    }

    pub async fn run(&self, identifier: &str, secret: &str) -> Result<Outcome, RunError> {
        for trial in 1..=self.config.max_trials {
            info!("Trial {}/{}", trial, self.config.max_trials);
            match self.trial(identifier, secret).await? {
                outcome @ (Outcome::Success | Outcome::AlreadySubmitted) => {
                    info!("Trial {} done: {}", trial, outcome);
                    return Ok(outcome);
                }
                Outcome::RetryableRejection => {
                    warn!(
                        "Trial {} rejected as retryable, backing off {:?}",
                        trial, self.config.retry_backoff
                    );
                    if trial < self.config.max_trials {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
                Outcome::Fatal(message) => return Err(RunError::Server(message)),
            }
        }
        Err(RunError::RetriesExhausted(self.config.max_trials))
    }

    /// One full trial: login, harvest, optional captcha, submit, classify.
    async fn trial(&self, identifier: &str, secret: &str) -> Result<Outcome, RunError> {
        let config = &self.config;

        info!("[{}] logging in to the SSO gateway", Phase::Authenticating);
        let session = client::build_session()?;
        let login_page = client::fetch_page(&session, &config.login_url).await?;
        let execution = harvest::extract_execution(&login_page)?;
        debug!("[{}] execution token: {}", Phase::Authenticating, execution);

        let key = client::fetch_public_key(&session, &config.pubkey_url).await?;
        let encrypted = crypto::encrypt(secret, &key)?;
        let body = client::post_credentials(
            &session,
            &config.login_url,
            identifier,
            &encrypted,
            &execution,
        )
        .await?;
        if body.contains(&config.login_branding_marker) {
            // Bounced back to the sign-in page: wrong credentials or an
            // expired execution token.
            return Err(RunError::LoginRejected);
        }

        info!("[{}] fetching the report landing page", Phase::Harvesting);
        let landing = client::fetch_page(&session, &config.base_url).await?;
        let mut payload = harvest::build_payload(&landing, Local::now(), config)?;
        if let (Some(number), Some(name)) = (payload.get("number"), payload.get("name")) {
            info!("Harvested state for {} {}", number, name);
        }

        if config.captcha_required {
            info!("[{}] fetching and reading the challenge image", Phase::Resolving);
            let image = client::fetch_captcha_image(&session, &config.captcha_url).await?;
            let code = self.recognizer.recognize(&image)?;
            info!("[{}] captcha read as '{}'", Phase::Resolving, code);
            payload.insert(config.captcha_field.clone(), json!(code));
        }

        if let Some(path) = &config.dump_payload {
            match serde_json::to_string_pretty(&payload) {
                Ok(text) => {
                    if let Err(e) = std::fs::write(path, text) {
                        warn!("Could not dump payload to {}: {}", path.display(), e);
                    }
                }
                Err(e) => warn!("Could not serialize payload dump: {}", e),
            }
        }

        info!("[{}] posting the report", Phase::Submitting);
        let response = client::post_report(&session, &config.save_url, &payload).await?;
        debug!("[{}] save response: e={} m={}", Phase::Submitting, response.e, response.m);
        Ok(classify(&response, &config.messages))
    }
}
