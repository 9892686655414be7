use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Claims {
    pub sub: i32,
    pub role: String,
    pub exp: usize,
}

/// Who is asking. Entitlement evaluation is defined for anonymous callers
/// too, so a missing or invalid token maps to `Anonymous` rather than 401.
pub enum Principal {
    Anonymous,
    User { user_id: i32, role: String },
}

fn bearer_or_cookie_token(parts: &Parts) -> Option<String> {
    if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
        let cookies = cookie_header.to_str().unwrap_or("");
        if let Some(token) = cookies.split(';').find_map(|c| {
            let c = c.trim();
            c.strip_prefix("auth_token=").map(|s| s.to_string())
        }) {
            return Some(token);
        }
    }
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|authz| authz.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
}

fn decode_token(token: &str) -> Option<Claims> {
    let secret = crate::config::JWT_SECRET.as_str();
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = bearer_or_cookie_token(parts)
            .and_then(|token| decode_token(&token))
            .map(|claims| Principal::User {
                user_id: claims.sub,
                role: claims.role,
            })
            .unwrap_or(Principal::Anonymous);
        Ok(principal)
    }
}

/// Authenticated user id; rejects anonymous callers.
pub struct RequireUser(pub i32);

#[async_trait]
impl<S> FromRequestParts<S> for RequireUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_or_cookie_token(parts)
            .ok_or((StatusCode::UNAUTHORIZED, "Missing token".to_string()))?;
        let claims = decode_token(&token)
            .ok_or((StatusCode::UNAUTHORIZED, "Invalid token".to_string()))?;
        Ok(RequireUser(claims.sub))
    }
}

pub struct RequireAdmin(pub i32);

#[async_trait]
impl<S> FromRequestParts<S> for RequireAdmin
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_or_cookie_token(parts)
            .ok_or((StatusCode::UNAUTHORIZED, "Missing token".to_string()))?;
        let claims = decode_token(&token)
            .ok_or((StatusCode::UNAUTHORIZED, "Invalid token".to_string()))?;
        if claims.role != "admin" {
            return Err((StatusCode::FORBIDDEN, "Admin required".to_string()));
        }
        Ok(RequireAdmin(claims.sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn issue(sub: i32, role: &str) -> String {
        let claims = Claims {
            sub,
            role: role.to_string(),
            exp: 9_999_999_999,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap()
    }

    fn parts_with_bearer(token: &str) -> Parts {
        let request = Request::builder()
            .header("Authorization", format!("Bearer {token}"))
            .body(axum::body::Body::empty())
            .unwrap();
        request.into_parts().0
    }

    #[tokio::test]
    async fn principal_from_bearer_token() {
        std::env::set_var("JWT_SECRET", "secret");
        let mut parts = parts_with_bearer(&issue(7, "user"));
        let principal = Principal::from_request_parts(&mut parts, &()).await.unwrap();
        match principal {
            Principal::User { user_id, role } => {
                assert_eq!(user_id, 7);
                assert_eq!(role, "user");
            }
            Principal::Anonymous => panic!("expected authenticated principal"),
        }
    }

    #[tokio::test]
    async fn missing_token_is_anonymous() {
        std::env::set_var("JWT_SECRET", "secret");
        let request = Request::builder().body(axum::body::Body::empty()).unwrap();
        let mut parts = request.into_parts().0;
        let principal = Principal::from_request_parts(&mut parts, &()).await.unwrap();
        assert!(matches!(principal, Principal::Anonymous));
    }

    #[tokio::test]
    async fn admin_extractor_rejects_plain_users() {
        std::env::set_var("JWT_SECRET", "secret");
        let mut parts = parts_with_bearer(&issue(3, "user"));
        let rejected = RequireAdmin::from_request_parts(&mut parts, &()).await;
        assert!(matches!(rejected, Err((StatusCode::FORBIDDEN, _))));

        let mut parts = parts_with_bearer(&issue(4, "admin"));
        let admin = RequireAdmin::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(admin.0, 4);
    }
}
