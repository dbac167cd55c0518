//! Error taxonomy for the ingest pipeline.
//!
//! Venue fetch errors partition into the classes the poller back-off cares
//! about; normalizer errors are dropped at the ingest boundary and never
//! poison a poller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    #[error("exchange error: {0}")]
    Exchange(String),

    #[error("unexpected venue error: {0}")]
    Unexpected(String),
}

impl VenueError {
    /// Throttle-class failures get the randomized 3-10s initial back-off.
    pub fn is_throttle(&self) -> bool {
        matches!(self, VenueError::RateLimited(_) | VenueError::Unavailable(_))
    }

    /// Classify an HTTP status from a venue REST endpoint.
    pub fn from_status(status: reqwest::StatusCode, venue: &str) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            VenueError::RateLimited(format!("{} returned {}", venue, status))
        } else if status.is_server_error() {
            VenueError::Unavailable(format!("{} returned {}", venue, status))
        } else {
            VenueError::Exchange(format!("{} returned {}", venue, status))
        }
    }
}

impl From<reqwest::Error> for VenueError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            VenueError::Network(err.to_string())
        } else if err.is_decode() {
            VenueError::Exchange(err.to_string())
        } else {
            VenueError::Unexpected(err.to_string())
        }
    }
}

/// Malformed venue payload: required fields missing or unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("malformed payload: missing {0}")]
    MissingField(&'static str),

    #[error("malformed payload: {0}")]
    Invalid(String),
}
