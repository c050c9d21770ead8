use std::borrow::Cow;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::TimeDelta;
use openstack_sdk::{
    AsyncOpenStack,
    api::{self, QueryAsync, compute::v2::server::{create_20, delete, list_detailed}},
    auth::AuthState,
    config::ConfigFile,
    types::ServiceType,
};
use openstack_types::compute::v2::server::response::{
    create::ServerResponse as CreateServerResponse,
    list_detailed::ServerResponse as ListServerResponse,
};
use serde::Deserialize;
use thiserror::Error as ThisError;
use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::params::{BootstrapParams, ProviderInstance};
use crate::provider::{Provider, normalize_status};

#[derive(Debug, ThisError)]
pub enum OpenStackError {
    #[error("openstack profile not found: {0}")]
    Profile(String),

    #[error("failed to build network request")]
    BuildNetworkRequest(#[from] create_20::NetworksBuilderError),

    #[error("failed to build server request")]
    BuildServerRequest(#[from] create_20::ServerBuilderError),

    #[error("failed to build request")]
    BuildRequest(#[from] create_20::RequestBuilderError),

    #[error("failed to build server list request")]
    BuildServerListRequest(#[from] list_detailed::RequestBuilderError),

    #[error("failed to build server deletion request")]
    BuildServerDeletionRequest(#[from] delete::RequestBuilderError),

    #[error(transparent)]
    Api(#[from] openstack_sdk::api::ApiError<openstack_sdk::RestError>),

    #[error(transparent)]
    OpenStack(#[from] openstack_sdk::OpenStackError),

    #[error(transparent)]
    OpenStackConfig(#[from] openstack_sdk::config::ConfigError),
}

impl From<OpenStackError> for Error {
    fn from(e: OpenStackError) -> Self {
        // the compute API either works or is worth retrying later
        Error::transient(format!("openstack: {e}"))
    }
}

/// Pool `extra_specs` understood by this provider.
#[derive(Debug, Default, Deserialize)]
struct OpenStackSpecs {
    network: Option<String>,
    key_name: Option<String>,
}

/// Nova-backed provider. Instances are recognized by the fleet name prefix,
/// so the pool filter is name-based rather than metadata-based.
pub struct OpenStackProvider {
    cloud: String,
    prefix: String,
    session: Mutex<AsyncOpenStack>,
}

impl OpenStackProvider {
    pub async fn new(cloud: &str, prefix: &str) -> std::result::Result<Self, OpenStackError> {
        let profile = ConfigFile::new()?
            .get_cloud_config(cloud)?
            .ok_or_else(|| OpenStackError::Profile(cloud.to_string()))?;
        let mut session = AsyncOpenStack::new(&profile).await?;
        session
            .discover_service_endpoint(&ServiceType::Compute)
            .await?;
        Ok(OpenStackProvider {
            cloud: cloud.to_string(),
            prefix: format!("{prefix}-"),
            session: Mutex::new(session),
        })
    }

    #[instrument(skip(self), fields(cloud = %self.cloud))]
    async fn session(&self) -> std::result::Result<MutexGuard<'_, AsyncOpenStack>, OpenStackError> {
        let mut session = self.session.lock().await;
        match session.get_auth_state(Some(TimeDelta::seconds(10))) {
            Some(AuthState::Expired) | Some(AuthState::AboutToExpire) => {
                session.authorize(None, false, true).await?;
                session
                    .discover_service_endpoint(&ServiceType::Compute)
                    .await?;
            }
            _ => {}
        }
        Ok(session)
    }

    async fn list_fleet_servers(&self) -> std::result::Result<Vec<ListServerResponse>, OpenStackError> {
        let session = self.session().await?;
        let ep = list_detailed::Request::builder().build()?;
        let data: Vec<ListServerResponse> = ep.query_async(&*session).await?;
        Ok(data
            .into_iter()
            .filter(|s| s.name.starts_with(&self.prefix))
            .collect())
    }

    async fn find_server(&self, name: &str) -> Result<ListServerResponse> {
        let servers = self.list_fleet_servers().await.map_err(Error::from)?;
        servers
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::not_found(format!("server {name}")))
    }
}

fn to_provider_instance(server: &ListServerResponse) -> ProviderInstance {
    ProviderInstance {
        provider_id: server.id.clone(),
        name: server.name.clone(),
        status: normalize_status(server.status.as_deref().unwrap_or("")),
        addresses: Vec::new(),
    }
}

#[async_trait]
impl Provider for OpenStackProvider {
    #[instrument(
        skip(self, bootstrap),
        fields(
            cloud = %self.cloud,
            name = %bootstrap.name,
            image = %bootstrap.image,
            flavor = %bootstrap.flavor,
        )
    )]
    async fn create_instance(&self, bootstrap: &BootstrapParams) -> Result<ProviderInstance> {
        let specs: OpenStackSpecs =
            serde_json::from_value(bootstrap.extra_specs.clone()).unwrap_or_default();
        let network = specs.network.ok_or_else(|| {
            Error::bad_request("openstack pools require extra_specs.network")
        })?;

        let mut server = create_20::ServerBuilder::default();
        server
            .name(&bootstrap.name)
            .image_ref(&bootstrap.image)
            .flavor_ref(&bootstrap.flavor)
            .networks(vec![
                create_20::NetworksBuilder::default()
                    .uuid(&network)
                    .build()
                    .map_err(OpenStackError::from)?,
            ])
            .user_data(Some(Cow::Owned(
                BASE64_STANDARD.encode(&bootstrap.user_data),
            )));
        if let Some(key_name) = &specs.key_name {
            server.key_name(key_name);
        }

        let ep = create_20::Request::builder()
            .server(server.build().map_err(OpenStackError::from)?)
            .build()
            .map_err(OpenStackError::from)?;

        let session = self.session().await.map_err(Error::from)?;
        let created: CreateServerResponse = ep
            .query_async(&*session)
            .await
            .map_err(OpenStackError::from)?;

        tracing::info!("successfully spawned server");
        Ok(ProviderInstance {
            provider_id: created.id,
            name: bootstrap.name.clone(),
            // nova reports BUILD first; the observer resolves it
            status: crate::params::ProviderInstanceStatus::Unknown,
            addresses: Vec::new(),
        })
    }

    async fn get_instance(&self, name: &str) -> Result<ProviderInstance> {
        let server = self.find_server(name).await?;
        Ok(to_provider_instance(&server))
    }

    #[instrument(skip(self), fields(cloud = %self.cloud, name))]
    async fn delete_instance(&self, name: &str) -> Result<()> {
        let server = self.find_server(name).await?;
        let ep = delete::Request::builder()
            .id(&server.id)
            .build()
            .map_err(OpenStackError::from)?;
        let session = self.session().await.map_err(Error::from)?;
        api::ignore(ep)
            .query_async(&*session)
            .await
            .map_err(OpenStackError::from)?;
        tracing::info!("successfully deleted server");
        Ok(())
    }

    async fn stop_instance(&self, _name: &str) -> Result<()> {
        // runners are ephemeral, the fleet only ever creates and deletes
        Err(Error::bad_request(
            "the openstack provider does not stop instances",
        ))
    }

    async fn start_instance(&self, _name: &str) -> Result<()> {
        Err(Error::bad_request(
            "the openstack provider does not start instances",
        ))
    }

    #[instrument(skip(self), fields(cloud = %self.cloud))]
    async fn list_instances(&self, _pool_id: &str) -> Result<Vec<ProviderInstance>> {
        let servers = self.list_fleet_servers().await.map_err(Error::from)?;
        Ok(servers.iter().map(to_provider_instance).collect())
    }

    async fn remove_all_instances(&self) -> Result<()> {
        let servers = self.list_fleet_servers().await.map_err(Error::from)?;
        for server in servers {
            let ep = delete::Request::builder()
                .id(&server.id)
                .build()
                .map_err(OpenStackError::from)?;
            let session = self.session().await.map_err(Error::from)?;
            api::ignore(ep)
                .query_async(&*session)
                .await
                .map_err(OpenStackError::from)?;
        }
        Ok(())
    }
}
