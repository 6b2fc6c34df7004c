use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hopper_core::auth::AuthError;
use hopper_core::error::HopperError;

use crate::error::AppError;
use crate::state::AppState;

/// User requests act as when token authentication is off.
pub const ANONYMOUS_USER: &str = "hopper";

/// The user a request was authenticated as. Inserted by [`require_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

/// Axum middleware that gates a route behind a bearer token.
///
/// Without a signer every request passes as [`ANONYMOUS_USER`]. Otherwise the
/// `Authorization` header must carry a valid token, either bare or after
/// `Bearer `; a missing or rejected token answers 401.
pub async fn require_token(State(app): State<AppState>, mut req: Request, next: Next) -> Response {
    let user = match &app.auth {
        None => ANONYMOUS_USER.to_string(),
        Some(signer) => {
            let verified = bearer_token(req.headers())
                .ok_or(AuthError::MissingToken)
                .and_then(|token| signer.verify(token));
            match verified {
                Ok(user) => user,
                Err(e) => {
                    tracing::debug!(path = %req.uri().path(), error = %e, "request rejected");
                    return AppError::from(HopperError::Auth(e)).into_response();
                }
            }
        }
    };
    req.extensions_mut().insert(AuthUser(user));
    next.run(req).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ if value.eq_ignore_ascii_case("bearer") => "",
        _ => value,
    };
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_prefix_is_optional() {
        assert_eq!(bearer_token(&headers("Bearer abc.def")), Some("abc.def"));
        assert_eq!(bearer_token(&headers("abc.def")), Some("abc.def"));
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
