use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query, State},
    http::{header, request::Parts, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Form, Json,
};
use tracing::{error, warn};

use crate::api::requests::{ConfirmQuery, PublishIssueRequest, SubscribeRequest, ValidationError};
use crate::api::responses::{ApiResponse, ErrorResponse, ValidationErrorDetail};
use crate::api::state::{AppState, Principal};
use crate::error::{AppError, Result};
use crate::idempotency::{CoordinatedResponse, StoredResponse};
use crate::services::SubscribeHandler;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Raw `Idempotency-Key` header, absent when the client sent none.
///
/// Only UTF-8 is checked here; key syntax is validated by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKeyHeader(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for IdempotencyKeyHeader
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        match parts.headers.get(IDEMPOTENCY_KEY_HEADER) {
            None => Ok(Self(None)),
            Some(value) => value
                .to_str()
                .map(|v| Self(Some(v.to_string())))
                .map_err(|_| AppError::InvalidKey("header is not valid UTF-8".to_string())),
        }
    }
}

fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::InvalidKey(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::Conflict { .. } | AppError::Duplicate(_) => StatusCode::CONFLICT,
        AppError::KeyReused(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::SendFailure(_)
        | AppError::TaskExhausted { .. }
        | AppError::Serialization(_)
        | AppError::Config(_)
        | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let message = if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ApiResponse::<()>::error(ErrorResponse::for_error(&self, message)));
        match self {
            AppError::Conflict {
                retry_after_secs, ..
            } => (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

/// Writes status, headers in their stored order, and body unchanged.
impl IntoResponse for StoredResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, self.body).into_response();
        let headers = response.headers_mut();
        headers.remove(header::CONTENT_TYPE);

        for pair in self.headers {
            match (
                HeaderName::from_bytes(pair.name.as_bytes()),
                HeaderValue::from_bytes(&pair.value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %pair.name, "Dropping stored header that is not valid HTTP"),
            }
        }
        response
    }
}

fn respond(result: Result<CoordinatedResponse>) -> Response {
    match result {
        Ok(coordinated) => coordinated.response.into_response(),
        Err(e) => e.into_response(),
    }
}

fn validation_failed(errors: Vec<ValidationError>) -> Response {
    let details: Vec<ValidationErrorDetail> = errors
        .into_iter()
        .map(|e| ValidationErrorDetail {
            field: e.field,
            message: e.message,
        })
        .collect();

    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::<()>::error(
            ErrorResponse::new("VALIDATION_ERROR", "Request validation failed").with_details(details),
        )),
    )
        .into_response()
}

/// Subscribe an email address, at most once per idempotency key.
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Form(request): Form<SubscribeRequest>,
) -> Response {
    if let Err(errors) = request.validate() {
        return validation_failed(errors);
    }

    let handler = match request.into_new_subscriber() {
        Ok(new_subscriber) => SubscribeHandler::new(new_subscriber, state.base_url.clone()),
        Err(e) => return e.into_response(),
    };

    respond(
        state
            .coordinator
            .execute(principal.id(), key.as_deref(), &handler)
            .await,
    )
}

/// Confirm a pending subscription from the emailed link.
pub async fn confirm_subscription(
    State(state): State<AppState>,
    Query(query): Query<ConfirmQuery>,
) -> Response {
    match state.subscriptions().confirm(&query.token).await {
        Ok(subscriber) => (StatusCode::OK, Json(ApiResponse::success(subscriber))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Publish a newsletter issue to every confirmed subscriber.
pub async fn publish_issue(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(request): Json<PublishIssueRequest>,
) -> Response {
    if let Err(errors) = request.validate() {
        return validation_failed(errors);
    }

    let handler = match request.into_handler() {
        Ok(handler) => handler,
        Err(e) => return e.into_response(),
    };

    respond(
        state
            .coordinator
            .execute(principal.id(), key.as_deref(), &handler)
            .await,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::HeaderPair;
    use axum::body::to_bytes;

    async fn extract(value: Option<&[u8]>) -> Result<IdempotencyKeyHeader> {
        let mut builder = axum::http::Request::builder().uri("/subscriptions");
        if let Some(value) = value {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_bytes(value).unwrap());
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        IdempotencyKeyHeader::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_header_extraction() {
        assert_eq!(extract(None).await.unwrap(), IdempotencyKeyHeader(None));
        assert_eq!(
            extract(Some(b"abc123")).await.unwrap(),
            IdempotencyKeyHeader(Some("abc123".to_string()))
        );
        assert!(matches!(
            extract(Some(b"ab\xffc")).await,
            Err(AppError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&AppError::InvalidKey("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&AppError::KeyReused("x".into())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(&AppError::Duplicate("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&AppError::StoreUnavailable(sqlx::Error::PoolTimedOut)),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_conflict_carries_retry_after() {
        let response = AppError::Conflict {
            message: "busy".to_string(),
            retry_after_secs: 3,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "REQUEST_IN_PROGRESS");
    }

    #[tokio::test]
    async fn test_stored_response_written_verbatim() {
        let stored = StoredResponse::new(
            201,
            vec![
                HeaderPair::new("content-type", "application/json"),
                HeaderPair::new("x-trace", "a"),
                HeaderPair::new("x-trace", "b"),
            ],
            b"{\"id\":7}".to_vec(),
        );
        let response = stored.into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        let traces: Vec<_> = response.headers().get_all("x-trace").iter().collect();
        assert_eq!(traces, vec!["a", "b"]);
        assert_eq!(response.headers().get_all(header::CONTENT_TYPE).iter().count(), 1);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"{\"id\":7}");
    }
}
