//! Campaign lifecycle routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use postbox_common::error::AppError;
use postbox_common::types::{CampaignListResponse, CampaignResponse, Page};
use postbox_engine::campaign::{CreateCampaignParams, UpdateCampaignParams};

use crate::middleware::actor::Actor;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/email/campaigns",
            get(list_campaigns).post(create_campaign),
        )
        .route(
            "/api/email/campaigns/{id}",
            get(get_campaign)
                .put(update_campaign)
                .delete(cancel_campaign),
        )
}

/// POST /api/email/campaigns: schedule a campaign, owned by the calling user.
async fn create_campaign(
    State(state): State<AppState>,
    actor: Actor,
    Json(params): Json<CreateCampaignParams>,
) -> Result<(StatusCode, Json<CampaignResponse>), AppError> {
    let campaign = state
        .campaigns
        .create_campaign(&params, actor.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn list_campaigns(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> Result<Json<CampaignListResponse>, AppError> {
    Ok(Json(state.campaigns.list_campaigns(page).await?))
}

async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignResponse>, AppError> {
    Ok(Json(state.campaigns.get_campaign(id).await?))
}

/// PUT /api/email/campaigns/{id}: edit a pending campaign.
async fn update_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(params): Json<UpdateCampaignParams>,
) -> Result<Json<CampaignResponse>, AppError> {
    Ok(Json(state.campaigns.update_campaign(id, &params).await?))
}

/// DELETE /api/email/campaigns/{id}: cancel a pending campaign.
async fn cancel_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.campaigns.cancel_campaign(id).await?;
    Ok(Json(serde_json::json!({"cancelled": true})))
}
