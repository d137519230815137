//! Classification of driver errors onto the pipeline taxonomy

use flowline_common::FlowlineError;
use reqwest::StatusCode;

/// Map a `sqlx` failure onto the pipeline taxonomy
pub fn db_error(err: sqlx::Error) -> FlowlineError {
    match err {
        sqlx::Error::PoolTimedOut => FlowlineError::timeout("database pool timed out"),
        sqlx::Error::Io(e) => FlowlineError::connection(format!("database I/O error: {}", e)),
        sqlx::Error::Tls(e) => FlowlineError::connection(format!("database TLS error: {}", e)),
        sqlx::Error::PoolClosed => FlowlineError::connection("database pool closed"),
        sqlx::Error::Configuration(e) => {
            FlowlineError::configuration(format!("invalid database configuration: {}", e))
        },
        other => FlowlineError::execution(format!("database error: {}", other)),
    }
}

/// Map a `reqwest` transport failure onto the pipeline taxonomy
pub fn http_error(err: reqwest::Error) -> FlowlineError {
    if err.is_timeout() {
        FlowlineError::timeout(format!("HTTP request timed out: {}", err))
    } else if err.is_connect() || err.is_request() {
        FlowlineError::connection(format!("HTTP request failed: {}", err))
    } else if err.is_builder() {
        FlowlineError::configuration(format!("invalid HTTP request: {}", err))
    } else {
        FlowlineError::execution(format!("HTTP error: {}", err))
    }
}

/// Map a non-success HTTP status onto the pipeline taxonomy
pub fn http_status_error(status: StatusCode, url: &str) -> FlowlineError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FlowlineError::connection(format!("credentials rejected by {} ({})", url, status))
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            FlowlineError::timeout(format!("{} timed out ({})", url, status))
        },
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            FlowlineError::connection(format!("{} unavailable ({})", url, status))
        },
        s => FlowlineError::execution(format!("{} returned {}", url, s)),
    }
}
