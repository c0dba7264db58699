use axum::{
    Extension,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};

use huddle_db::ChatError;
use huddle_types::api::Claims;

use crate::auth::AppState;
use crate::error::ApiResult;

/// Serve an attachment to a participant who can still see a message
/// carrying it. Anything else is a 404.
pub async fn get_blob(
    State(state): State<AppState>,
    Path((category, name)): Path<(String, String)>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let blob = state
        .service
        .open_blob(category.clone(), name.clone(), claims.sub)
        .await?;
    let Some((bytes, mime)) = blob else {
        return Err(ChatError::NotFound(format!("blob {category}/{name}")).into());
    };
    Ok((
        [
            (header::CONTENT_TYPE, mime),
            // Names are content hashes
            (header::CACHE_CONTROL, "private, max-age=31536000, immutable"),
        ],
        bytes,
    ))
}

pub async fn health() -> &'static str {
    "ok"
}
