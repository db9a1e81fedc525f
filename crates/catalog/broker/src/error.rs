use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("timed out while calling the broker")]
    Timeout,
    #[error("{}", display_http(*status, error_message.as_deref(), description.as_deref()))]
    Http {
        status: u16,
        error_message: Option<String>,
        description: Option<String>,
    },
    #[error("{0}")]
    Other(String),
}

fn display_http(status: u16, error_message: Option<&str>, description: Option<&str>) -> String {
    let mut message = format!("broker returned status code {status}");
    if let Some(error) = error_message {
        message.push_str(&format!("; error: {error}"));
    }
    if let Some(description) = description {
        message.push_str(&format!("; description: {description}"));
    }
    message
}

impl BrokerError {
    pub fn http(status: u16) -> Self {
        Self::Http {
            status,
            error_message: None,
            description: None,
        }
    }

    pub fn other(message: impl ToString) -> Self {
        Self::Other(message.to_string())
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a failed bind may have left a credential behind on the
    /// broker, so that an unbind must follow to clean it up.
    pub fn is_ambiguous_bind_failure(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Http { status, .. } => {
                matches!(status, 201..=299 | 408 | 500..=599)
            }
            Self::Other(_) => false,
        }
    }
}

impl From<::reqwest::Error> for BrokerError {
    fn from(error: ::reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if let Some(status) = error.status() {
            Self::http(status.as_u16())
        } else {
            Self::Other(error.to_string())
        }
    }
}

pub type Result<T, E = BrokerError> = ::core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_bind_failures() {
        assert!(BrokerError::Timeout.is_ambiguous_bind_failure());
        for status in [201, 202, 299, 408, 500, 503, 599] {
            assert!(
                BrokerError::http(status).is_ambiguous_bind_failure(),
                "{status} should require orphan mitigation",
            );
        }
        for status in [200, 400, 401, 404, 409, 422] {
            assert!(
                !BrokerError::http(status).is_ambiguous_bind_failure(),
                "{status} should not require orphan mitigation",
            );
        }
        assert!(!BrokerError::other("connection refused").is_ambiguous_bind_failure());
    }

    #[test]
    fn http_errors_render_broker_messages() {
        let error = BrokerError::Http {
            status: 409,
            error_message: Some("Conflict".into()),
            description: Some("instance exists".into()),
        };
        assert_eq!(error.status_code(), Some(409));
        assert_eq!(
            error.to_string(),
            "broker returned status code 409; error: Conflict; description: instance exists",
        );
        assert_eq!(BrokerError::Timeout.status_code(), None);
    }
}
