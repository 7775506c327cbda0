//! Mapping of transport and HTTP failures onto the client error taxonomy

use reqwest::StatusCode;
use statchat_api_contract::ErrorDetail;
use statchat_client_api::ApiError;

/// Map a non-2xx response onto `ApiError`
///
/// `authed` marks requests that carried the primary bearer token: for those,
/// a 401 means the session itself is invalid and must be torn down. On
/// credential endpoints (login, register, escalation) a 4xx is a rejection
/// of the submitted credentials and surfaces the server's `detail`.
pub fn classify_status(status: StatusCode, body: &str, authed: bool) -> ApiError {
    let detail = serde_json::from_str::<ErrorDetail>(body)
        .map(|e| e.detail)
        .unwrap_or_else(|_| body.to_string());

    if authed && status == StatusCode::UNAUTHORIZED {
        return ApiError::Unauthorized;
    }
    if status.is_client_error() {
        ApiError::Denied(detail)
    } else {
        ApiError::Server {
            status: status.as_u16(),
            detail,
        }
    }
}

/// Map a reqwest transport error onto `ApiError`
pub fn classify_transport(err: reqwest::Error) -> ApiError {
    if err.is_decode() {
        ApiError::Decode(err.to_string())
    } else {
        ApiError::Network(err.to_string())
    }
}
