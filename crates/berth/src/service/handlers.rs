//! Request handlers. Each one calls the matching engine operation.

use std::collections::HashMap;

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use berth_protocol::wire::{
    DELETED_KEY, DeleteEntries, ExportQuery, FilterQuery, ForceQuery, PingResponse, UNTAGGED_KEY,
};
use berth_protocol::{
    BoolReport, ContainerCreateOptions, ContainerSummary, ImageDeleteOptions, ImageHistoryReport,
    ImageListOptions, ImagePruneOptions, ImagePruneReport, ImageSummary, SystemDfOptions,
    SystemDfReport, SystemInfo, SystemResetOptions,
};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::ServiceState;
use super::error::{ApiError, ApiResult};
use crate::engine::EngineContext;
use crate::save::{ScopedArchive, check_format};

fn filters(query: &FilterQuery) -> ApiResult<berth_protocol::Filters> {
    query
        .decode_filters()
        .map_err(|e| ApiError::bad_request(format!("invalid filters: {e}")))
}

pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn info(State(state): State<ServiceState>) -> ApiResult<Json<SystemInfo>> {
    Ok(Json(state.containers.info(&EngineContext::new()).await?))
}

pub async fn system_df(
    State(state): State<ServiceState>,
    Query(opts): Query<SystemDfOptions>,
) -> ApiResult<Json<SystemDfReport>> {
    Ok(Json(
        state
            .containers
            .system_df(&EngineContext::new(), opts)
            .await?,
    ))
}

pub async fn system_reset(
    State(state): State<ServiceState>,
    Query(opts): Query<SystemResetOptions>,
) -> ApiResult<StatusCode> {
    state
        .containers
        .system_reset(&EngineContext::new(), opts)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_images(
    State(state): State<ServiceState>,
    Query(query): Query<FilterQuery>,
) -> ApiResult<Json<Vec<ImageSummary>>> {
    let opts = ImageListOptions {
        all: query.all,
        filters: filters(&query)?,
    };
    Ok(Json(state.images.list(&EngineContext::new(), opts).await?))
}

pub async fn image_exists(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
) -> ApiResult<Json<BoolReport>> {
    Ok(Json(state.images.exists(&EngineContext::new(), &name).await?))
}

/// Removal steps as single-key maps: untagged names first, then deleted ids.
pub async fn delete_image(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<Json<DeleteEntries>> {
    let report = state
        .images
        .delete(
            &EngineContext::new(),
            &[name],
            ImageDeleteOptions { force: query.force },
        )
        .await?;

    let entry = |key: &str, value: String| HashMap::from([(key.to_string(), value)]);
    let mut entries: DeleteEntries = report
        .untagged
        .into_iter()
        .map(|tag| entry(UNTAGGED_KEY, tag))
        .collect();
    entries.extend(report.deleted.into_iter().map(|id| entry(DELETED_KEY, id)));
    Ok(Json(entries))
}

pub async fn image_history(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ImageHistoryReport>> {
    Ok(Json(
        state.images.history(&EngineContext::new(), &name).await?,
    ))
}

pub async fn prune_images(
    State(state): State<ServiceState>,
    Query(query): Query<FilterQuery>,
) -> ApiResult<Json<ImagePruneReport>> {
    let opts = ImagePruneOptions {
        all: query.all,
        filters: filters(&query)?,
    };
    Ok(Json(state.images.prune(&EngineContext::new(), opts).await?))
}

/// Stream the image as a tar archive in the requested layout.
pub async fn export_image(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let format = check_format(&query.format, query.compress)?;
    let archive = ScopedArchive::new_in(std::env::temp_dir())?;
    state
        .exporter
        .export_archive(
            &EngineContext::new(),
            &name,
            format,
            query.compress,
            &query.tag_list(),
            &archive,
        )
        .await?;

    // The open handle keeps the data readable after the scratch file is unlinked.
    let file = archive.reopen()?;
    let size = file.metadata()?.len();
    drop(archive);
    debug!(image = %name, %format, size, "streaming export");

    let stream = ReaderStream::new(tokio::fs::File::from_std(file));
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-tar".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

pub async fn list_containers(
    State(state): State<ServiceState>,
) -> ApiResult<Json<Vec<ContainerSummary>>> {
    Ok(Json(
        state.containers.container_list(&EngineContext::new()).await?,
    ))
}

pub async fn create_container(
    State(state): State<ServiceState>,
    Json(opts): Json<ContainerCreateOptions>,
) -> ApiResult<(StatusCode, Json<ContainerSummary>)> {
    let created = state
        .containers
        .container_create(&EngineContext::new(), opts)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn start_container(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .containers
        .container_start(&EngineContext::new(), &id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop_container(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .containers
        .container_stop(&EngineContext::new(), &id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_container(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<StatusCode> {
    state
        .containers
        .container_remove(&EngineContext::new(), &id, query.force)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
