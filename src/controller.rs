use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};

use crate::backoff::Clock;
use crate::error::{Error, Result};
use crate::forge::ForgeFactory;
use crate::params::{Entity, EntityKind, EntityUpdate, WorkflowJob};
use crate::pool::{EventSink, LifecycleEvent, PoolManager, PoolManagerConfig};
use crate::provider::Provider;
use crate::store::Store;

#[derive(Clone, Debug)]
pub struct ManagerSummary {
    pub entity_id: String,
    pub entity_name: String,
    pub kind: EntityKind,
    pub degraded: bool,
}

pub struct ControllerDeps {
    pub store: Arc<dyn Store>,
    pub providers: HashMap<String, Arc<dyn Provider>>,
    pub forge_factory: Arc<dyn ForgeFactory>,
    pub manager_config: PoolManagerConfig,
    pub clock: Arc<dyn Clock>,
}

enum Command {
    Load {
        entity: Entity,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        entity_id: String,
        reply: oneshot::Sender<Result<PoolManager>>,
    },
    FindForJob {
        job: Box<WorkflowJob>,
        reply: oneshot::Sender<Result<PoolManager>>,
    },
    List {
        reply: oneshot::Sender<Vec<ManagerSummary>>,
    },
    Delete {
        entity_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Refresh {
        entity_id: String,
        update: EntityUpdate,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Event(LifecycleEvent),
}

/// Process-wide registry of pool managers, keyed by entity id. All mutations
/// run on a single coordinator task; callers talk to it over a channel, so
/// no lock is ever nested with a per-manager lock.
#[derive(Clone)]
pub struct Controller {
    tx: mpsc::Sender<Command>,
}

impl Controller {
    pub fn spawn(deps: ControllerDeps) -> Controller {
        let (tx, rx) = mpsc::channel(64);
        let coordinator = Coordinator {
            deps,
            managers: HashMap::new(),
            events: Arc::new(ChannelSink { tx: tx.clone() }),
        };
        tokio::spawn(coordinator.run(rx));
        Controller { tx }
    }

    pub async fn load(&self, entity: Entity) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Load { entity, reply }).await?;
        rx.await.map_err(closed)?
    }

    pub async fn get(&self, entity_id: &str) -> Result<PoolManager> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get {
            entity_id: entity_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(closed)?
    }

    /// Resolves the manager owning a workflow job: repository scope first,
    /// then organization, then enterprise.
    pub async fn find_for_job(&self, job: &WorkflowJob) -> Result<PoolManager> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FindForJob {
            job: Box::new(job.clone()),
            reply,
        })
        .await?;
        rx.await.map_err(closed)?
    }

    pub async fn list(&self) -> Result<Vec<ManagerSummary>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::List { reply }).await?;
        rx.await.map_err(closed)
    }

    pub async fn delete(&self, entity_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Delete {
            entity_id: entity_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(closed)?
    }

    pub async fn refresh(&self, entity_id: &str, update: EntityUpdate) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Refresh {
            entity_id: entity_id.to_string(),
            update,
            reply,
        })
        .await?;
        rx.await.map_err(closed)?
    }

    /// Stops every manager; used by the graceful shutdown path.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::fatal("controller is not running"))
    }
}

fn closed<E>(_: E) -> Error {
    Error::fatal("controller is not running")
}

struct Entry {
    manager: PoolManager,
    entity_name: String,
    kind: EntityKind,
    degraded: bool,
}

struct Coordinator {
    deps: ControllerDeps,
    managers: HashMap<String, Entry>,
    events: Arc<dyn EventSink>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Load { entity, reply } => {
                    let _ = reply.send(self.load(entity).await);
                }
                Command::Get { entity_id, reply } => {
                    let _ = reply.send(self.get(&entity_id));
                }
                Command::FindForJob { job, reply } => {
                    let _ = reply.send(self.find_for_job(&job));
                }
                Command::List { reply } => {
                    let mut summaries: Vec<ManagerSummary> = self
                        .managers
                        .iter()
                        .map(|(id, entry)| ManagerSummary {
                            entity_id: id.clone(),
                            entity_name: entry.entity_name.clone(),
                            kind: entry.kind,
                            degraded: entry.degraded,
                        })
                        .collect();
                    summaries.sort_by(|a, b| a.entity_name.cmp(&b.entity_name));
                    let _ = reply.send(summaries);
                }
                Command::Delete { entity_id, reply } => {
                    let _ = reply.send(self.delete(&entity_id).await);
                }
                Command::Refresh {
                    entity_id,
                    update,
                    reply,
                } => {
                    let _ = reply.send(self.refresh(&entity_id, update).await);
                }
                Command::Shutdown { reply } => {
                    for (entity_id, entry) in self.managers.drain() {
                        if let Err(e) = entry.manager.stop().await {
                            tracing::warn!(entity = %entity_id, error = %e, "stopping manager failed");
                        }
                    }
                    let _ = reply.send(());
                    break;
                }
                Command::Event(event) => self.handle_event(event),
            }
        }
    }

    async fn load(&mut self, entity: Entity) -> Result<()> {
        if self.managers.contains_key(&entity.id) {
            return Ok(());
        }
        let forge = self.deps.forge_factory.for_entity(&entity)?;
        let entry = Entry {
            entity_name: entity.name.clone(),
            kind: entity.kind,
            degraded: false,
            manager: PoolManager::new(
                entity.clone(),
                self.deps.store.clone(),
                self.deps.providers.clone(),
                forge,
                self.deps.manager_config.clone(),
                self.deps.clock.clone(),
                self.events.clone(),
                rand::rng().random(),
            ),
        };
        entry.manager.start().await?;
        self.managers.insert(entity.id, entry);
        Ok(())
    }

    fn get(&self, entity_id: &str) -> Result<PoolManager> {
        self.managers
            .get(entity_id)
            .map(|entry| entry.manager.clone())
            .ok_or_else(|| Error::not_found(format!("no pool manager for entity {entity_id}")))
    }

    fn find_for_job(&self, job: &WorkflowJob) -> Result<PoolManager> {
        let scopes: [(EntityKind, Option<String>); 3] = [
            (
                EntityKind::Repository,
                job.repository.as_ref().map(|r| r.full_name.clone()),
            ),
            (
                EntityKind::Organization,
                job.organization.as_ref().map(|o| o.login.clone()),
            ),
            (
                EntityKind::Enterprise,
                job.enterprise.as_ref().map(|e| e.slug.clone()),
            ),
        ];
        for (kind, name) in scopes {
            let Some(name) = name else { continue };
            let found = self.managers.values().find(|entry| {
                entry.kind == kind && entry.entity_name.eq_ignore_ascii_case(&name)
            });
            if let Some(entry) = found {
                return Ok(entry.manager.clone());
            }
        }
        Err(Error::not_found("no pool manager owns this workflow job"))
    }

    async fn delete(&mut self, entity_id: &str) -> Result<()> {
        let entry = self
            .managers
            .remove(entity_id)
            .ok_or_else(|| Error::not_found(format!("no pool manager for entity {entity_id}")))?;
        entry.manager.stop().await
    }

    async fn refresh(&mut self, entity_id: &str, update: EntityUpdate) -> Result<()> {
        let entry = self
            .managers
            .get(entity_id)
            .ok_or_else(|| Error::not_found(format!("no pool manager for entity {entity_id}")))?;

        let mut snapshot = entry.manager.entity().await;
        if let Some(creds) = &update.credentials_name {
            snapshot.credentials_name = creds.clone();
        }
        if let Some(internal) = &update.internal {
            snapshot.internal = internal.clone();
        }
        let forge = self.deps.forge_factory.for_entity(&snapshot)?;
        entry.manager.refresh_state(update, Some(forge)).await
    }

    fn handle_event(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::ManagerDegraded { entity_id, reason } => {
                tracing::error!(entity = %entity_id, reason = %reason, "manager flagged degraded");
                if let Some(entry) = self.managers.get_mut(&entity_id) {
                    entry.degraded = true;
                    let manager = entry.manager.clone();
                    tokio::spawn(async move {
                        let _ = manager.stop().await;
                    });
                }
            }
            LifecycleEvent::ManagerStarted { entity_id } => {
                tracing::debug!(entity = %entity_id, "manager reported started");
            }
            LifecycleEvent::ManagerStopped { entity_id } => {
                tracing::debug!(entity = %entity_id, "manager reported stopped");
            }
        }
    }
}

struct ChannelSink {
    tx: mpsc::Sender<Command>,
}

impl EventSink for ChannelSink {
    fn notify(&self, event: LifecycleEvent) {
        let _ = self.tx.try_send(Command::Event(event));
    }
}
