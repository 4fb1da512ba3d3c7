//! HTTP API for the allocation coordinator
//!
//! # API Endpoints
//!
//! - `POST /api/v1/registrations` - pick a host pool for a VM and return a registration token
//! - `POST /api/v1/registrations/:pool_name/complete` - wait for the VM to join and assign it
//! - `DELETE /api/v1/vms/:vm_id` - remove a VM's session hosts and surplus empty stacks
//! - `GET /api/v1/stacks/audit` - list partially created stacks
//! - `GET /healthz` - liveness probe
//!
//! Every endpoint except the probe answers with an [`api_types::ApiResponse`]
//! envelope; failures carry a non-2xx status and `success: false`.

use core::error::Error;

use api_types::ApiResponse;
use error_stack::Report;
use poem::http::StatusCode;
use poem::web::Json;
use poem::IntoResponse;
use tracing::error;
use tracing::warn;

use crate::domain::allocation::error::NamingError;
use crate::domain::allocation::error::StackError;
use crate::domain::allocation::AllocationError;

pub mod handlers;
pub mod server;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

/// Maps a coordinator failure onto an HTTP status.
pub fn status_for(report: &Report<AllocationError>) -> StatusCode {
    match report.current_context() {
        AllocationError::UnsupportedOs { .. } | AllocationError::InvalidRequest { .. } => {
            StatusCode::BAD_REQUEST
        }
        AllocationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        AllocationError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ if report.contains::<NamingError>() => StatusCode::BAD_REQUEST,
        _ if report
            .downcast_ref::<StackError>()
            .is_some_and(|err| matches!(err, StackError::NameMismatch { .. })) =>
        {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Turns a coordinator failure into an error response with a JSON body.
pub fn error_response(report: Report<AllocationError>) -> poem::Error {
    let status = status_for(&report);
    if status.is_server_error() {
        error!(status = status.as_u16(), error = ?report, "request failed");
    } else {
        warn!(status = status.as_u16(), error = %report, "request rejected");
    }

    let body = Json(ApiResponse::<()>::error(report.current_context().to_string()));
    poem::Error::from_response((status, body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::allocation::error::CreateStep;

    fn pool_selection() -> AllocationError {
        AllocationError::PoolSelection {
            vm_id: "vm-1".to_string(),
        }
    }

    #[test]
    fn test_api_error_display_formatting() {
        let server_error = ApiError::ServerError {
            message: "address in use".to_string(),
        };
        assert_eq!(server_error.to_string(), "Server error: address in use");
    }

    #[test]
    fn validation_failures_are_client_errors() {
        let invalid = Report::new(AllocationError::InvalidRequest {
            reason: "empty".to_string(),
        });
        assert_eq!(status_for(&invalid), StatusCode::BAD_REQUEST);

        let naming = Report::new(NamingError::SegmentLimit {
            suffix: "ZULU-ZULU".to_string(),
            max_segments: 2,
        })
        .change_context(pool_selection());
        assert_eq!(status_for(&naming), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn backend_failures_are_gateway_errors() {
        let partial = Report::new(StackError::CreateStep {
            step: CreateStep::Workspace,
            suffix: "ALPHA".to_string(),
        })
        .change_context(pool_selection());
        assert_eq!(status_for(&partial), StatusCode::BAD_GATEWAY);

        let timeout = Report::new(AllocationError::Timeout {
            vm_id: "vm-1".to_string(),
            pool_name: "HP-Personal-ALPHA".to_string(),
            waited_secs: 1200,
        });
        assert_eq!(status_for(&timeout), StatusCode::GATEWAY_TIMEOUT);

        let cancelled = Report::new(AllocationError::Cancelled {
            vm_id: "vm-1".to_string(),
            pool_name: "HP-Personal-ALPHA".to_string(),
        });
        assert_eq!(status_for(&cancelled), StatusCode::SERVICE_UNAVAILABLE);
    }
}
