use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;

/// Main error type for the driver agent
#[derive(Debug)]
pub enum AgentError {
    // Connectivity errors
    ChannelUnavailable(String),
    ChannelClosed,
    NetworkTimeout,
    NetworkConnection(String),
    HttpClient(String),
    DeliveryFailed(String),

    // Data errors
    MalformedOffer(String),
    MissingField(String),
    JsonParsing(String),
    JsonSerialization(String),

    // Logical race errors
    RideAlreadyTaken(String),
    RideNotCurrent(String),
    SlotOccupied(String),
    AcceptInFlight,
    InvalidRideStatus { expected: String, actual: String },

    // Local errors
    NoActiveRide,
    NoLocation,
    OtpUnavailable,
    OtpMismatch,
    NotOnline,
    WorkingHoursRejected(String),

    // Persistent store errors
    StoreConnection(String),
    StoreQuery(String),
    StoreSerialization(String),

    // Configuration
    InvalidConfiguration(String),

    // Coordinator task is gone
    CoordinatorStopped,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::ChannelUnavailable(msg) => write!(f, "Dispatch channel unavailable: {}", msg),
            AgentError::ChannelClosed => write!(f, "Dispatch channel is disconnected"),
            AgentError::NetworkTimeout => write!(f, "Network request timed out"),
            AgentError::NetworkConnection(msg) => write!(f, "Network connection error: {}", msg),
            AgentError::HttpClient(msg) => write!(f, "HTTP client error: {}", msg),
            AgentError::DeliveryFailed(msg) => write!(f, "Delivery failed: {}", msg),

            AgentError::MalformedOffer(msg) => write!(f, "Malformed ride offer: {}", msg),
            AgentError::MissingField(field) => write!(f, "Missing required field: {}", field),
            AgentError::JsonParsing(msg) => write!(f, "JSON parsing error: {}", msg),
            AgentError::JsonSerialization(msg) => write!(f, "JSON serialization error: {}", msg),

            AgentError::RideAlreadyTaken(id) => write!(f, "Ride {} was taken by another driver", id),
            AgentError::RideNotCurrent(id) => write!(f, "Ride {} is no longer the current ride", id),
            AgentError::SlotOccupied(id) => write!(f, "Ride slot is occupied by ride {}", id),
            AgentError::AcceptInFlight => write!(f, "An accept request is already in flight"),
            AgentError::InvalidRideStatus { expected, actual } => {
                write!(f, "Invalid ride status: expected {}, found {}", expected, actual)
            }

            AgentError::NoActiveRide => write!(f, "No active ride"),
            AgentError::NoLocation => write!(f, "Current location is not available yet"),
            AgentError::OtpUnavailable => write!(f, "OTP not yet received from server"),
            AgentError::OtpMismatch => write!(f, "The entered OTP is incorrect"),
            AgentError::NotOnline => write!(f, "Driver is offline"),
            AgentError::WorkingHoursRejected(msg) => write!(f, "Working hours request rejected: {}", msg),

            AgentError::StoreConnection(msg) => write!(f, "State store connection error: {}", msg),
            AgentError::StoreQuery(msg) => write!(f, "State store query error: {}", msg),
            AgentError::StoreSerialization(msg) => write!(f, "State store serialization error: {}", msg),

            AgentError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            AgentError::CoordinatorStopped => write!(f, "Ride coordinator has stopped"),
        }
    }
}

impl std::error::Error for AgentError {}

impl AgentError {
    /// Connectivity failures are recovered by reconnect/retry before being surfaced.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            AgentError::ChannelUnavailable(_)
                | AgentError::ChannelClosed
                | AgentError::NetworkTimeout
                | AgentError::NetworkConnection(_)
                | AgentError::HttpClient(_)
                | AgentError::DeliveryFailed(_)
        )
    }

    pub fn invalid_status(expected: impl Into<String>, actual: impl fmt::Display) -> Self {
        AgentError::InvalidRideStatus {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        AgentError::MalformedOffer(msg.into())
    }

    pub fn missing(field: impl Into<String>) -> Self {
        AgentError::MissingField(field.into())
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            AgentError::NoActiveRide => (StatusCode::NOT_FOUND, "no_active_ride"),
            AgentError::OtpMismatch => (StatusCode::BAD_REQUEST, "otp_mismatch"),
            AgentError::OtpUnavailable => (StatusCode::CONFLICT, "otp_unavailable"),
            AgentError::InvalidRideStatus { .. } => (StatusCode::CONFLICT, "invalid_ride_status"),
            AgentError::RideAlreadyTaken(_) => (StatusCode::CONFLICT, "ride_already_taken"),
            AgentError::SlotOccupied(_) => (StatusCode::CONFLICT, "slot_occupied"),
            AgentError::RideNotCurrent(_) => (StatusCode::CONFLICT, "ride_not_current"),
            AgentError::AcceptInFlight => (StatusCode::CONFLICT, "accept_in_flight"),
            AgentError::NotOnline => (StatusCode::CONFLICT, "not_online"),
            AgentError::WorkingHoursRejected(_) => (StatusCode::FORBIDDEN, "working_hours_rejected"),
            AgentError::NoLocation => (StatusCode::SERVICE_UNAVAILABLE, "no_location"),
            AgentError::CoordinatorStopped => (StatusCode::SERVICE_UNAVAILABLE, "coordinator_stopped"),
            AgentError::ChannelUnavailable(_) | AgentError::ChannelClosed | AgentError::NetworkTimeout => {
                (StatusCode::SERVICE_UNAVAILABLE, "connectivity")
            }
            // All other errors are treated as internal errors
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        (status, axum::Json(error_response)).into_response()
    }
}

// Convenience type alias for Results
pub type AgentResult<T> = Result<T, AgentError>;

impl From<redis::RedisError> for AgentError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::IoError => AgentError::StoreConnection(err.to_string()),
            redis::ErrorKind::AuthenticationFailed => {
                AgentError::StoreConnection("Authentication failed".to_string())
            }
            _ => AgentError::StoreQuery(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AgentError::NetworkTimeout
        } else if err.is_connect() {
            AgentError::NetworkConnection(err.to_string())
        } else {
            AgentError::HttpClient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() {
            AgentError::JsonParsing(err.to_string())
        } else {
            AgentError::JsonSerialization(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for AgentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AgentError::NetworkTimeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AgentError::RideAlreadyTaken("R1".to_string());
        assert_eq!(error.to_string(), "Ride R1 was taken by another driver");
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(AgentError::ChannelClosed.is_connectivity());
        assert!(AgentError::NetworkTimeout.is_connectivity());
        assert!(!AgentError::OtpMismatch.is_connectivity());
        assert!(!AgentError::malformed("bad pickup").is_connectivity());
    }

    #[test]
    fn test_invalid_status_helper() {
        match AgentError::invalid_status("accepted", "idle") {
            AgentError::InvalidRideStatus { expected, actual } => {
                assert_eq!(expected, "accepted");
                assert_eq!(actual, "idle");
            }
            _ => panic!("Expected InvalidRideStatus error"),
        }
    }

    #[test]
    fn test_json_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(AgentError::from(err), AgentError::JsonParsing(_)));
    }
}
