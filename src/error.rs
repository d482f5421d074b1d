use crate::listing::FetchError;

/// Failures surfaced by the monitor's task and user operations.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// URL does not point at the watched listing site.
    #[error("invalid source url: {0}")]
    InvalidSource(String),

    /// Transport or parse failure; retried on the next natural tick.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// Page was reachable but carried no listings.
    #[error("no listings found at {0}")]
    NoListingsFound(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("cadence must be a positive number of minutes")]
    InvalidCadence,

    #[error("subscription length must be between 1 and 36500 days")]
    InvalidDays,

    #[error("store error: {0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for MonitorError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(e)
    }
}

impl From<FetchError> for MonitorError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::InvalidSource(url) => Self::InvalidSource(url),
            FetchError::FetchFailed(msg) => Self::FetchFailed(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_keep_their_kind() {
        let e: MonitorError = FetchError::InvalidSource("https://example.com".into()).into();
        assert!(matches!(e, MonitorError::InvalidSource(_)));

        let e: MonitorError = FetchError::FetchFailed("HTTP 503".into()).into();
        assert_eq!(e.to_string(), "fetch failed: HTTP 503");
    }

    #[test]
    fn store_errors_carry_context() {
        let inner = anyhow::anyhow!("disk full").context("update cursor");
        let e = MonitorError::from(inner);
        assert_eq!(e.to_string(), "store error: update cursor: disk full");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MonitorError>();
    }
}
