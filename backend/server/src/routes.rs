use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{RawQuery, State},
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{AppendHeaders, IntoResponse},
};
use chrono::Utc;

use crate::{
    error::AppError,
    ranking::RankingSnapshot,
    state::AppState,
    utils::{popular_limit, query_params, required_slug, toggle_request},
};

pub async fn info_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<impl IntoResponse, AppError> {
    let params = query_params(query.as_deref())?;
    let slug = required_slug(params.slug.as_deref())?;

    let resolved = state.identity.resolve(&headers);
    let response = state.upvotes.info(&slug, &resolved.identity).await;

    let cookie = resolved
        .minted
        .then(|| (SET_COOKIE, state.identity.set_cookie(&resolved.token)));

    Ok((AppendHeaders(cookie), Json(response)))
}

pub async fn toggle_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let request = toggle_request(&headers, query.as_deref(), &body)?;

    let resolved = state.identity.resolve(&headers);
    let response = state
        .upvotes
        .toggle(&request.slug, &resolved.identity, request.request_id.as_deref())
        .await?;

    let token = state
        .identity
        .refresh(&resolved.token, Utc::now().timestamp());

    Ok((
        AppendHeaders([(SET_COOKIE, state.identity.set_cookie(&token))]),
        Json(response),
    ))
}

pub async fn popular_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<Json<RankingSnapshot>, AppError> {
    let params = query_params(query.as_deref())?;
    let limit = popular_limit(params.limit.as_deref(), state.config.popular_limit)?;

    Ok(Json(state.ranking.ranking(limit).await))
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn not_found_handler() -> AppError {
    AppError::NotFound
}
