//! Caller identity forwarded by the upstream auth gateway.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use postbox_common::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The user on whose behalf a request is made, when the gateway supplied one.
///
/// A missing header yields `user_id: None`; a header that is not a UUID is
/// rejected with 400.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: Option<Uuid>,
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(USER_ID_HEADER) else {
            return Ok(Actor { user_id: None });
        };

        let user_id = value
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or_else(|| AppError::Validation("X-User-Id must be a UUID".to_string()))?;

        Ok(Actor {
            user_id: Some(user_id),
        })
    }
}
