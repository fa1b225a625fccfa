use crate::client::SaveResponse;
use crate::config::ServerMessages;

/// Terminal classification of one submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The server already holds a report for today; success-equivalent.
    AlreadySubmitted,
    /// Transient rejection (wrong verification code); worth a fresh trial.
    RetryableRejection,
    /// Anything the server says that we do not recognize. The message is
    /// surfaced verbatim.
    Fatal(String),
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "submitted"),
            Outcome::AlreadySubmitted => write!(f, "already submitted today"),
            Outcome::RetryableRejection => write!(f, "rejected, retryable"),
            Outcome::Fatal(message) => write!(f, "rejected: {}", message),
        }
    }
}

/// Maps the save endpoint's `{e, m}` response onto an [`Outcome`]. The
/// server only speaks through free-text messages, so everything except
/// `e == 0` hangs on the exact literals in [`ServerMessages`].
pub fn classify(response: &SaveResponse, messages: &ServerMessages) -> Outcome {
    if response.e == 0 {
        return Outcome::Success;
    }
    if response.m == messages.already_submitted {
        Outcome::AlreadySubmitted
    } else if response.m == messages.wrong_captcha {
        Outcome::RetryableRejection
    } else {
        Outcome::Fatal(response.m.clone())
    }
}
