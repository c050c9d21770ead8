use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use octocrab::{Octocrab, OctocrabBuilder};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::forge::{ForgeClient, ForgeFactory, HookInfo};
use crate::params::{Entity, EntityKind, ForgeRunner, JitConfig, RunnerApplication};

/// GitHub REST adapter for the forge port, one instance per entity.
pub struct GithubForge {
    octocrab: Octocrab,
    kind: EntityKind,
    name: String,
    webhook_url: String,
}

pub struct GithubForgeFactory {
    credentials: HashMap<String, Credentials>,
    webhook_url: String,
}

impl GithubForgeFactory {
    pub fn new(credentials: &[Credentials], webhook_url: String) -> Self {
        GithubForgeFactory {
            credentials: credentials
                .iter()
                .map(|c| (c.name.clone(), c.clone()))
                .collect(),
            webhook_url,
        }
    }
}

impl ForgeFactory for GithubForgeFactory {
    fn for_entity(&self, entity: &Entity) -> Result<Arc<dyn ForgeClient>> {
        let creds = self.credentials.get(&entity.credentials_name).ok_or_else(|| {
            Error::bad_request(format!(
                "credentials {} are not defined",
                entity.credentials_name
            ))
        })?;
        let octocrab = OctocrabBuilder::default()
            .personal_token(creds.token.clone())
            .build()
            .map_err(map_err)?;
        Ok(Arc::new(GithubForge {
            octocrab,
            kind: entity.kind,
            name: entity.name.clone(),
            webhook_url: self.webhook_url.clone(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct RunnersPage {
    total_count: i64,
    runners: Vec<ApiRunner>,
}

#[derive(Debug, Deserialize)]
struct ApiRunner {
    id: i64,
    name: String,
    status: String,
    busy: bool,
    #[serde(default)]
    labels: Vec<ApiLabel>,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationToken {
    token: String,
}

#[derive(Debug, Serialize)]
struct JitRequest<'a> {
    name: &'a str,
    runner_group_id: i64,
    labels: &'a [String],
}

#[derive(Debug, Deserialize)]
struct JitResponse {
    runner: JitRunner,
    encoded_jit_config: String,
}

#[derive(Debug, Deserialize)]
struct JitRunner {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct RunnerGroupsPage {
    runner_groups: Vec<RunnerGroup>,
}

#[derive(Debug, Deserialize)]
struct RunnerGroup {
    id: i64,
    name: String,
}

#[derive(Debug, Serialize)]
struct HookRequest<'a> {
    name: &'a str,
    active: bool,
    events: &'a [&'a str],
    config: HookConfig<'a>,
}

#[derive(Debug, Serialize)]
struct HookConfig<'a> {
    url: &'a str,
    content_type: &'a str,
    secret: &'a str,
    insecure_ssl: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiHook {
    id: i64,
    active: bool,
    #[serde(default)]
    events: Vec<String>,
    config: ApiHookConfig,
}

#[derive(Debug, Deserialize)]
struct ApiHookConfig {
    #[serde(default)]
    url: Option<String>,
}

impl GithubForge {
    fn base(&self) -> String {
        match self.kind {
            EntityKind::Repository => format!("/repos/{}", self.name),
            EntityKind::Organization => format!("/orgs/{}", self.name),
            EntityKind::Enterprise => format!("/enterprises/{}", self.name),
        }
    }

    async fn resolve_runner_group(&self, group: Option<&str>) -> Result<i64> {
        let Some(group) = group else { return Ok(1) };
        // repositories have no runner groups
        if self.kind == EntityKind::Repository {
            return Ok(1);
        }
        let route = format!("{}/actions/runner-groups?per_page=100", self.base());
        let page: RunnerGroupsPage = self
            .octocrab
            .get(route, None::<&()>)
            .await
            .map_err(map_err)?;
        page.runner_groups
            .into_iter()
            .find(|g| g.name.eq_ignore_ascii_case(group))
            .map(|g| g.id)
            .ok_or_else(|| Error::not_found(format!("runner group {group}")))
    }

    async fn list_hooks(&self) -> Result<Vec<ApiHook>> {
        if self.kind == EntityKind::Enterprise {
            return Err(Error::bad_request(
                "enterprise scopes do not support repository-style hooks",
            ));
        }
        let route = format!("{}/hooks?per_page=100", self.base());
        self.octocrab.get(route, None::<&()>).await.map_err(map_err)
    }
}

#[async_trait]
impl ForgeClient for GithubForge {
    #[instrument(skip(self), fields(entity = %self.name))]
    async fn list_runners(&self) -> Result<Vec<ForgeRunner>> {
        let mut runners = Vec::new();
        let mut page = 1u32;
        loop {
            let route = format!(
                "{}/actions/runners?per_page=100&page={page}",
                self.base()
            );
            let listed: RunnersPage = self
                .octocrab
                .get(route, None::<&()>)
                .await
                .map_err(map_err)?;
            let fetched = listed.runners.len();
            runners.extend(listed.runners.into_iter().map(|r| ForgeRunner {
                id: r.id,
                name: r.name,
                status: r.status,
                busy: r.busy,
                labels: r.labels.into_iter().map(|l| l.name).collect(),
            }));
            if fetched == 0 || runners.len() as i64 >= listed.total_count {
                break;
            }
            page += 1;
        }
        Ok(runners)
    }

    #[instrument(skip(self), fields(entity = %self.name, runner_id))]
    async fn remove_runner(&self, runner_id: i64) -> Result<()> {
        let route = format!("{}/actions/runners/{runner_id}", self.base());
        match self.octocrab._delete(route, None::<&()>).await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.as_u16() == 404 {
                    Ok(())
                } else if status.as_u16() == 401 {
                    Err(Error::Unauthorized)
                } else if status.is_server_error() {
                    Err(Error::transient(format!("removing runner: http {status}")))
                } else {
                    Err(Error::bad_request(format!("removing runner: http {status}")))
                }
            }
            Err(e) => {
                let mapped = map_err(e);
                if mapped.is_not_found() { Ok(()) } else { Err(mapped) }
            }
        }
    }

    async fn registration_token(&self) -> Result<String> {
        let route = format!("{}/actions/runners/registration-token", self.base());
        let token: RegistrationToken = self
            .octocrab
            .post(route, None::<&()>)
            .await
            .map_err(map_err)?;
        Ok(token.token)
    }

    #[instrument(skip(self, labels), fields(entity = %self.name, runner_name))]
    async fn jit_runner_config(
        &self,
        runner_name: &str,
        labels: &[String],
        runner_group: Option<&str>,
    ) -> Result<JitConfig> {
        let runner_group_id = self.resolve_runner_group(runner_group).await?;
        let route = format!("{}/actions/runners/generate-jitconfig", self.base());
        let body = JitRequest {
            name: runner_name,
            runner_group_id,
            labels,
        };
        let response: JitResponse = self
            .octocrab
            .post(route, Some(&body))
            .await
            .map_err(map_err)?;
        Ok(JitConfig {
            encoded_jit_config: response.encoded_jit_config,
            runner_id: response.runner.id,
        })
    }

    #[instrument(skip(self, secret), fields(entity = %self.name))]
    async fn install_webhook(&self, url: &str, secret: &str) -> Result<HookInfo> {
        if self.kind == EntityKind::Enterprise {
            return Err(Error::bad_request(
                "enterprise scopes do not support repository-style hooks",
            ));
        }
        let route = format!("{}/hooks", self.base());
        let body = HookRequest {
            name: "web",
            active: true,
            events: &["workflow_job"],
            config: HookConfig {
                url,
                content_type: "json",
                secret,
                insecure_ssl: "0",
            },
        };
        let hook: ApiHook = self
            .octocrab
            .post(route, Some(&body))
            .await
            .map_err(map_err)?;
        Ok(HookInfo {
            id: hook.id,
            url: hook.config.url.unwrap_or_else(|| url.to_string()),
            active: hook.active,
            events: hook.events,
        })
    }

    async fn uninstall_webhook(&self, url: &str) -> Result<()> {
        let hooks = self.list_hooks().await?;
        let Some(hook) = hooks
            .into_iter()
            .find(|h| h.config.url.as_deref() == Some(url))
        else {
            return Ok(());
        };
        let route = format!("{}/hooks/{}", self.base(), hook.id);
        match self.octocrab._delete(route, None::<&()>).await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) if response.status().as_u16() == 404 => Ok(()),
            Ok(response) => Err(Error::bad_request(format!(
                "removing hook: http {}",
                response.status()
            ))),
            Err(e) => {
                let mapped = map_err(e);
                if mapped.is_not_found() { Ok(()) } else { Err(mapped) }
            }
        }
    }

    async fn webhook_info(&self) -> Result<Option<HookInfo>> {
        let hooks = self.list_hooks().await?;
        Ok(hooks
            .into_iter()
            .find(|h| h.config.url.as_deref() == Some(self.webhook_url.as_str()))
            .map(|h| HookInfo {
                id: h.id,
                url: h.config.url.unwrap_or_default(),
                active: h.active,
                events: h.events,
            }))
    }

    async fn fetch_tools(&self) -> Result<Vec<RunnerApplication>> {
        let route = format!("{}/actions/runners/downloads", self.base());
        self.octocrab.get(route, None::<&()>).await.map_err(map_err)
    }
}

/// Maps octocrab failures onto the fleet error taxonomy. Everything the
/// network can transiently do ends up `Transient`.
fn map_err(e: octocrab::Error) -> Error {
    match &e {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            match status {
                404 => Error::not_found(source.message.clone()),
                401 => Error::Unauthorized,
                403 => Error::forbidden(source.message.clone()),
                409 => Error::conflict(source.message.clone()),
                400 | 422 => Error::bad_request(source.message.clone()),
                _ if status >= 500 => Error::transient(format!("github: {}", source.message)),
                _ => Error::bad_request(source.message.clone()),
            }
        }
        _ => Error::transient(format!("github: {e}")),
    }
}
