//! Identity asserted by the upstream proxy.
//!
//! Authentication happens before requests reach this service; the proxy
//! forwards the caller as `x-user-id` and, for operators, `x-user-role: admin`.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::IntoResponse,
};
use tracing::debug;

use crate::jobs::Actor;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_ROLE: &str = "x-user-role";
pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone)]
pub struct RequestUser {
    pub user_id: String,
    pub is_admin: bool,
}

impl RequestUser {
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.user_id.clone(),
            is_admin: self.is_admin,
        }
    }
}

pub enum RequestUserRejection {
    MissingIdentity,
}

impl IntoResponse for RequestUserRejection {
    fn into_response(self) -> axum::response::Response {
        match self {
            RequestUserRejection::MissingIdentity => {
                (StatusCode::FORBIDDEN, "missing x-user-id header").into_response()
            }
        }
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl<S: Send + Sync> FromRequestParts<S> for RequestUser {
    type Rejection = RequestUserRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = match header_value(parts, HEADER_USER_ID) {
            Some(user_id) => user_id.to_string(),
            None => {
                debug!("No {} header on {}", HEADER_USER_ID, parts.uri.path());
                return Err(RequestUserRejection::MissingIdentity);
            }
        };
        let is_admin = header_value(parts, HEADER_USER_ROLE)
            .map_or(false, |role| role.eq_ignore_ascii_case(ADMIN_ROLE));
        Ok(RequestUser { user_id, is_admin })
    }
}
