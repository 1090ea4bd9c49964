use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::redemption::RouteError;
use crate::registry::RegistryError;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<RegistryError> for ProblemResponse {
    fn from(err: RegistryError) -> Self {
        let (status, problem_type) = match &err {
            RegistryError::NotConfigured => (StatusCode::SERVICE_UNAVAILABLE, "not_configured"),
            RegistryError::NoLinkedAccount => (StatusCode::BAD_REQUEST, "no_linked_account"),
            RegistryError::NotFound => (StatusCode::NOT_FOUND, "subscription_not_found"),
            RegistryError::Remote(_) => (StatusCode::BAD_GATEWAY, "remote_api_error"),
            RegistryError::Subscription(_) | RegistryError::Account(_) => {
                error!(stage = "registry", error = %err, "registry storage failure");
                return ProblemResponse::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    "failed to access subscription storage",
                );
            }
        };
        ProblemResponse::new(status, problem_type, err.to_string())
    }
}

impl From<RouteError> for ProblemResponse {
    fn from(err: RouteError) -> Self {
        error!(stage = "router", error = %err, "redemption storage failure");
        ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            "failed to access redemption storage",
        )
    }
}
