use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use tracing::debug;

use huddle_gateway::auth::verify_token;

use crate::auth::AppState;

/// Extract and validate the JWT from the Authorization header. The verified
/// `Claims` are made available to handlers as an extension.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = verify_token(bearer.token(), &state.jwt_secret).map_err(|e| {
        debug!("Rejected bearer token for {}: {}", req.uri().path(), e);
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
