use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::forge::HookInfo;
use crate::params::{
    Entity, EntityKind, EntityUpdate, Instance, InternalConfig, OsArch, OsType, Pool,
};
use crate::store::Store;

#[derive(Clone)]
pub struct ApiState {
    pub controller: Controller,
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
    /// Identifies this controller installation in derived config.
    pub controller_id: String,
}

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/entities", get(list_entities).post(create_entity))
        .route(
            "/entities/{id}",
            get(get_entity).put(update_entity).delete(delete_entity),
        )
        .route("/entities/{id}/pools", get(list_pools).post(create_pool))
        .route("/entities/{id}/instances", get(list_instances))
        .route(
            "/entities/{id}/webhook",
            get(webhook_info).post(install_webhook).delete(uninstall_webhook),
        )
        .route(
            "/pools/{id}",
            get(get_pool).put(update_pool).delete(delete_pool),
        )
        .route("/instances/{name}", delete(force_delete_instance))
}

#[derive(Debug, Deserialize)]
pub struct CreateEntityRequest {
    pub kind: EntityKind,
    pub name: String,
    pub credentials_name: String,
    pub webhook_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEntityRequest {
    pub credentials_name: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EntityView {
    #[serde(flatten)]
    pub entity: Entity,
    pub running: bool,
    pub degraded: bool,
}

async fn list_entities(State(state): State<ApiState>) -> Result<Json<Vec<EntityView>>> {
    let entities = state.store.list_entities().await?;
    let summaries = state.controller.list().await?;
    let views = entities
        .into_iter()
        .map(|entity| {
            let summary = summaries.iter().find(|s| s.entity_id == entity.id);
            EntityView {
                running: summary.is_some(),
                degraded: summary.is_some_and(|s| s.degraded),
                entity,
            }
        })
        .collect();
    Ok(Json(views))
}

async fn create_entity(
    State(state): State<ApiState>,
    Json(req): Json<CreateEntityRequest>,
) -> Result<(StatusCode, Json<Entity>)> {
    if req.name.is_empty() {
        return Err(Error::bad_request("entity name must not be empty"));
    }
    if req.webhook_secret.is_empty() {
        return Err(Error::bad_request("webhook secret must not be empty"));
    }
    if !state
        .config
        .credentials
        .iter()
        .any(|c| c.name == req.credentials_name)
    {
        return Err(Error::bad_request(format!(
            "credentials {} are not defined",
            req.credentials_name
        )));
    }

    let internal = internal_config(&state, &req.credentials_name);
    let entity = Entity {
        id: uuid::Uuid::new_v4().to_string(),
        kind: req.kind,
        name: req.name,
        credentials_name: req.credentials_name,
        webhook_secret: req.webhook_secret,
        internal,
        created_at: chrono::Utc::now(),
    };
    let entity = state.store.create_entity(entity).await?;
    state.controller.load(entity.clone()).await?;
    Ok((StatusCode::CREATED, Json(entity)))
}

async fn get_entity(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Entity>> {
    Ok(Json(state.store.get_entity(&id).await?))
}

async fn update_entity(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateEntityRequest>,
) -> Result<Json<Entity>> {
    let mut entity = state.store.get_entity(&id).await?;
    if let Some(creds) = &req.credentials_name {
        if !state.config.credentials.iter().any(|c| &c.name == creds) {
            return Err(Error::bad_request(format!(
                "credentials {creds} are not defined"
            )));
        }
        entity.credentials_name = creds.clone();
    }
    if let Some(secret) = &req.webhook_secret {
        if secret.is_empty() {
            return Err(Error::bad_request("webhook secret must not be empty"));
        }
        entity.webhook_secret = secret.clone();
    }
    let internal = internal_config(&state, &entity.credentials_name);
    entity.internal = internal.clone();
    let entity = state.store.update_entity(entity).await?;

    state
        .controller
        .refresh(
            &id,
            EntityUpdate {
                credentials_name: req.credentials_name,
                webhook_secret: req.webhook_secret,
                internal: Some(internal),
            },
        )
        .await?;
    Ok(Json(entity))
}

async fn delete_entity(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    // refuses while pools exist
    state.store.delete_entity(&id).await?;
    match state.controller.delete(&id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub provider_name: String,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub tags: Vec<String>,
    #[serde(default)]
    pub min_idle_runners: u32,
    pub max_runners: u32,
    #[serde(default = "default_bootstrap_timeout")]
    pub runner_bootstrap_timeout: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub extra_specs: serde_json::Value,
    #[serde(default)]
    pub github_runner_group: Option<String>,
}

fn default_bootstrap_timeout() -> u32 {
    20
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct UpdatePoolRequest {
    pub image: Option<String>,
    pub flavor: Option<String>,
    pub tags: Option<Vec<String>>,
    pub min_idle_runners: Option<u32>,
    pub max_runners: Option<u32>,
    pub runner_bootstrap_timeout: Option<u32>,
    pub enabled: Option<bool>,
    pub priority: Option<u32>,
    pub extra_specs: Option<serde_json::Value>,
}

async fn create_pool(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
    Json(req): Json<CreatePoolRequest>,
) -> Result<(StatusCode, Json<Pool>)> {
    // entity must exist and be managed
    state.store.get_entity(&entity_id).await?;
    let pool = Pool {
        id: uuid::Uuid::new_v4().to_string(),
        entity_id,
        provider_name: req.provider_name,
        image: req.image,
        flavor: req.flavor,
        os_type: req.os_type,
        os_arch: req.os_arch,
        tags: req.tags,
        min_idle_runners: req.min_idle_runners,
        max_runners: req.max_runners,
        runner_bootstrap_timeout: req.runner_bootstrap_timeout,
        enabled: req.enabled,
        priority: req.priority,
        extra_specs: req.extra_specs,
        github_runner_group: req.github_runner_group,
        created_at: chrono::Utc::now(),
    };
    pool.validate()?;
    let pool = state.store.create_pool(pool).await?;
    Ok((StatusCode::CREATED, Json(pool)))
}

async fn list_pools(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
) -> Result<Json<Vec<Pool>>> {
    state.store.get_entity(&entity_id).await?;
    Ok(Json(state.store.list_entity_pools(&entity_id).await?))
}

async fn get_pool(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<Pool>> {
    Ok(Json(state.store.get_pool(&id).await?))
}

async fn update_pool(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UpdatePoolRequest>,
) -> Result<Json<Pool>> {
    let mut pool = state.store.get_pool(&id).await?;
    if let Some(image) = req.image {
        pool.image = image;
    }
    if let Some(flavor) = req.flavor {
        pool.flavor = flavor;
    }
    if let Some(tags) = req.tags {
        pool.tags = tags;
    }
    if let Some(min_idle) = req.min_idle_runners {
        pool.min_idle_runners = min_idle;
    }
    if let Some(max) = req.max_runners {
        pool.max_runners = max;
    }
    if let Some(timeout) = req.runner_bootstrap_timeout {
        pool.runner_bootstrap_timeout = timeout;
    }
    if let Some(enabled) = req.enabled {
        pool.enabled = enabled;
    }
    if let Some(priority) = req.priority {
        pool.priority = priority;
    }
    if let Some(extra_specs) = req.extra_specs {
        pool.extra_specs = extra_specs;
    }
    pool.validate()?;
    Ok(Json(state.store.update_pool(pool).await?))
}

async fn delete_pool(State(state): State<ApiState>, Path(id): Path<String>) -> Result<StatusCode> {
    // refuses while instances exist
    state.store.delete_pool(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_instances(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
) -> Result<Json<Vec<Instance>>> {
    state.store.get_entity(&entity_id).await?;
    Ok(Json(state.store.list_entity_instances(&entity_id).await?))
}

async fn force_delete_instance(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    let instance = state.store.get_instance(&name).await?;
    let pool = state.store.get_pool(&instance.pool_id).await?;
    let manager = state.controller.get(&pool.entity_id).await?;
    manager.force_delete_runner(&name).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
pub struct HookView {
    pub id: i64,
    pub url: String,
    pub active: bool,
    pub events: Vec<String>,
}

impl From<HookInfo> for HookView {
    fn from(info: HookInfo) -> Self {
        HookView {
            id: info.id,
            url: info.url,
            active: info.active,
            events: info.events,
        }
    }
}

async fn webhook_info(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
) -> Result<Json<Option<HookView>>> {
    let manager = state.controller.get(&entity_id).await?;
    Ok(Json(manager.webhook_info().await?.map(HookView::from)))
}

async fn install_webhook(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
) -> Result<(StatusCode, Json<HookView>)> {
    let manager = state.controller.get(&entity_id).await?;
    let info = manager.install_webhook(&state.config.webhook_url()).await?;
    Ok((StatusCode::CREATED, Json(info.into())))
}

async fn uninstall_webhook(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
) -> Result<StatusCode> {
    let manager = state.controller.get(&entity_id).await?;
    manager.uninstall_webhook(&state.config.webhook_url()).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn internal_config(state: &ApiState, credentials_name: &str) -> InternalConfig {
    let base_url = state
        .config
        .credentials
        .iter()
        .find(|c| c.name == credentials_name)
        .and_then(|c| c.base_url.clone())
        .unwrap_or_default();
    InternalConfig {
        controller_id: state.controller_id.clone(),
        forge_base_url: base_url,
        callback_url: state.config.callback_url(),
        metadata_url: state.config.metadata_url(),
    }
}
