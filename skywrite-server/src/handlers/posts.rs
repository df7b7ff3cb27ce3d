//! Scheduled-post CRUD. Posts are editable and cancellable only while
//! PENDING; everything else is the dispatcher's business.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use skywrite_core::store::PostUpdate;
use skywrite_model::{
    NewPost, PostId, PostStatus, validate_content, validate_schedule_time,
};

use crate::errors::{AppError, AppResult};
use crate::infra::app_state::AppState;
use crate::middleware::session::CurrentSession;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostRequest {
    pub content: String,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePostRequest {
    pub content: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// `POST /posts`
pub async fn create_post(
    State(state): State<AppState>,
    session: CurrentSession,
    Json(body): Json<CreatePostRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let new = NewPost::standalone(session.user_id, body.content, body.scheduled_at);
    new.validate(Utc::now())
        .map_err(|e| AppError::validation(e.to_string()))?;

    let post = state.posts.insert(&new).await?;
    Ok((StatusCode::CREATED, Json(json!({ "post": post }))))
}

/// `GET /posts`
pub async fn list_posts(
    State(state): State<AppState>,
    session: CurrentSession,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let status = query
        .status
        .as_deref()
        .map(PostStatus::parse)
        .transpose()
        .map_err(|e| AppError::validation(e.to_string()))?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let result = state
        .posts
        .list_for_user(session.user_id, status, page, limit)
        .await?;
    Ok(Json(json!({
        "posts": result.posts,
        "total": result.total,
        "page": page,
        "limit": limit,
    })))
}

/// `GET /posts/{id}`
pub async fn get_post(
    State(state): State<AppState>,
    session: CurrentSession,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let post = state
        .posts
        .get(PostId(id))
        .await?
        .ok_or_else(|| AppError::not_found("post not found"))?;
    if post.user_id != session.user_id {
        return Err(AppError::forbidden("post belongs to another user"));
    }
    Ok(Json(json!({ "post": post })))
}

/// `PUT /posts/{id}` — allowed only while PENDING.
pub async fn update_post(
    State(state): State<AppState>,
    session: CurrentSession,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdatePostRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if body.content.is_none() && body.scheduled_at.is_none() {
        return Err(AppError::validation("nothing to update"));
    }
    if let Some(content) = &body.content {
        validate_content(content).map_err(|e| AppError::validation(e.to_string()))?;
    }
    if let Some(scheduled_at) = body.scheduled_at {
        validate_schedule_time(scheduled_at, Utc::now())
            .map_err(|e| AppError::validation(e.to_string()))?;
    }

    let post = state
        .posts
        .update_pending(
            PostId(id),
            session.user_id,
            &PostUpdate {
                content: body.content,
                scheduled_at: body.scheduled_at,
            },
        )
        .await?;
    Ok(Json(json!({ "post": post })))
}

/// `DELETE /posts/{id}` — cancels a PENDING post.
pub async fn delete_post(
    State(state): State<AppState>,
    session: CurrentSession,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    state.posts.cancel_pending(PostId(id), session.user_id).await?;
    Ok(Json(json!({ "success": true })))
}
