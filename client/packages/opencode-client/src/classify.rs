use opencode_client_error::{detail_from_body, ClientError};

use crate::transport::{TransportError, TransportErrorKind, TransportResponse};

/// Maps a raw transport outcome to the client taxonomy. `resource` names the
/// entity a 404 refers to; `operation` names the call for timeouts.
pub fn classify(
    outcome: Result<TransportResponse, TransportError>,
    base_url: &str,
    operation: &str,
    resource: &str,
) -> Result<TransportResponse, ClientError> {
    match outcome {
        Ok(response) if response.is_success() => Ok(response),
        Ok(response) => Err(classify_status(
            response.status,
            &response.body,
            operation,
            resource,
        )),
        Err(err) => Err(classify_transport(&err, base_url, operation)),
    }
}

/// Only 5xx answers are retryable server errors. Informational and redirect
/// statuses are not something this client follows.
pub fn classify_status(status: u16, body: &[u8], operation: &str, resource: &str) -> ClientError {
    let detail = detail_from_body(body);
    match status {
        404 => ClientError::NotFound {
            resource: resource.to_string(),
        },
        409 => ClientError::Conflict {
            detail: detail.unwrap_or_else(|| format!("{resource} conflicts with server state")),
        },
        400..=499 => ClientError::BadRequest {
            status,
            detail: detail.unwrap_or_else(|| "request rejected".to_string()),
        },
        500..=599 => ClientError::ServerError { status, detail },
        _ => ClientError::InvalidResponse {
            operation: operation.to_string(),
            message: format!("unexpected HTTP status {status}"),
        },
    }
}

pub fn classify_transport(err: &TransportError, base_url: &str, operation: &str) -> ClientError {
    match err.kind {
        TransportErrorKind::Timeout => ClientError::Timeout {
            operation: operation.to_string(),
        },
        TransportErrorKind::Connect | TransportErrorKind::Body | TransportErrorKind::Request => {
            ClientError::ConnectionFailure {
                base_url: base_url.to_string(),
                message: err.message.clone(),
            }
        }
    }
}
