use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use keystone::Error;
use serde::Serialize;
use tonic::Code;

/// A [`keystone::Error`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn authority_status(code: Code) -> StatusCode {
    match code {
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            Error::AdmissionDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::ExclusionTimeout { .. } => StatusCode::CONFLICT,
            Error::Deadline { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Authority { code, .. } => authority_status(*code),
            Error::Bus { .. } | Error::ExecutionFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::AllocatorUnavailable { .. }
            | Error::LeaseExhausted { .. }
            | Error::LeaseExpired { .. }
            | Error::NotStarted { .. }
            | Error::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Error::ChannelError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            Error::AllocatorUnavailable { .. } => "allocator_unavailable",
            Error::LeaseExhausted { .. } => "lease_exhausted",
            Error::LeaseExpired { .. } => "lease_expired",
            Error::AdmissionDenied { .. } => "admission_denied",
            Error::ValidationFailed { .. } => "validation_failed",
            Error::ExecutionFailed { .. } => "execution_failed",
            Error::ExclusionTimeout { .. } => "exclusion_timeout",
            Error::Deadline { .. } => "deadline",
            Error::Authority { .. } => "authority",
            Error::Bus { .. } => "bus",
            Error::ChannelError { .. } => "channel",
            Error::NotStarted { .. } => "not_started",
            Error::ServiceShutdown => "service_shutdown",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (
                Error::ValidationFailed {
                    reason: "bad".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (Error::Deadline { task_id: 1 }, StatusCode::GATEWAY_TIMEOUT),
            (Error::ServiceShutdown, StatusCode::SERVICE_UNAVAILABLE),
            (
                Error::Authority {
                    code: Code::AlreadyExists,
                    message: "collection docs already exists".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                Error::ExclusionTimeout {
                    collection: "docs".into(),
                    requeues: 5,
                },
                StatusCode::CONFLICT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
