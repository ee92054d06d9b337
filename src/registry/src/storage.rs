use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::{api::core::v1::Service, apimachinery::pkg::apis::meta::v1::Time};
use kube::ResourceExt;
use tokio::sync::RwLock;

use crate::{error::Error, service::DEFAULT_NAMESPACE};

pub const DRY_RUN_ALL: &str = "All";

fn is_dry_run(dry_run: &[String]) -> bool {
    dry_run.iter().any(|d| d == DRY_RUN_ALL)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub dry_run: Vec<String>,
}

impl CreateOptions {
    pub fn dry_run() -> CreateOptions {
        CreateOptions {
            dry_run: vec![DRY_RUN_ALL.to_string()],
        }
    }

    pub fn is_dry_run(&self) -> bool {
        is_dry_run(&self.dry_run)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub dry_run: Vec<String>,
}

impl UpdateOptions {
    pub fn dry_run() -> UpdateOptions {
        UpdateOptions {
            dry_run: vec![DRY_RUN_ALL.to_string()],
        }
    }

    pub fn is_dry_run(&self) -> bool {
        is_dry_run(&self.dry_run)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub dry_run: Vec<String>,
    pub preconditions: Option<Preconditions>,
}

impl DeleteOptions {
    pub fn dry_run() -> DeleteOptions {
        DeleteOptions {
            dry_run: vec![DRY_RUN_ALL.to_string()],
            preconditions: None,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        is_dry_run(&self.dry_run)
    }
}

/// Persistence for Services.
///
/// `delete` returns whether the object is gone. An object carrying
/// finalizers is only marked for deletion.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create(&self, svc: Service, opts: &CreateOptions) -> Result<Service, Error>;
    async fn update(&self, svc: Service, opts: &UpdateOptions) -> Result<Service, Error>;
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(Service, bool), Error>;
    async fn get(&self, namespace: &str, name: &str) -> Result<Service, Error>;
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Service>, Error>;
}

type Key = (String, String);

fn key_of(svc: &Service) -> Key {
    (
        svc.namespace().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        svc.name_any(),
    )
}

#[derive(Debug, Default)]
struct Objects {
    services: BTreeMap<Key, Service>,
    revision: u64,
}

impl Objects {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// In-process store keyed by namespace and name.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<Objects>,
}

impl MemoryStore {
    pub async fn len(&self) -> usize {
        self.objects.read().await.services.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create(&self, mut svc: Service, opts: &CreateOptions) -> Result<Service, Error> {
        let key = key_of(&svc);
        let mut objects = self.objects.write().await;
        if objects.services.contains_key(&key) {
            return Err(Error::AlreadyExists {
                namespace: key.0,
                name: key.1,
            });
        }
        if opts.is_dry_run() {
            return Ok(svc);
        }

        let revision = objects.next_revision();
        svc.metadata.namespace = Some(key.0.clone());
        svc.metadata.uid = Some(format!("{}-{}-{}", key.0, key.1, revision));
        svc.metadata.resource_version = Some(revision);
        svc.metadata.creation_timestamp = Some(Time(Utc::now()));
        svc.metadata.deletion_timestamp = None;
        objects.services.insert(key, svc.clone());
        Ok(svc)
    }

    async fn update(&self, mut svc: Service, opts: &UpdateOptions) -> Result<Service, Error> {
        let key = key_of(&svc);
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.services.get(&key) else {
            return Err(Error::NotFound {
                namespace: key.0,
                name: key.1,
            });
        };
        if let Some(rv) = svc.metadata.resource_version.as_deref() {
            if Some(rv) != stored.metadata.resource_version.as_deref() {
                return Err(Error::Conflict {
                    namespace: key.0,
                    name: key.1,
                });
            }
        }

        svc.metadata.namespace = Some(key.0.clone());
        svc.metadata.uid = stored.metadata.uid.clone();
        svc.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        svc.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        if opts.is_dry_run() {
            svc.metadata.resource_version = stored.metadata.resource_version.clone();
            return Ok(svc);
        }

        svc.metadata.resource_version = Some(objects.next_revision());
        objects.services.insert(key, svc.clone());
        Ok(svc)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(Service, bool), Error> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.services.get(&key) else {
            return Err(Error::NotFound {
                namespace: key.0,
                name: key.1,
            });
        };

        if let Some(pre) = opts.preconditions.as_ref() {
            let uid_mismatch = pre.uid.is_some() && pre.uid != stored.metadata.uid;
            let rv_mismatch = pre.resource_version.is_some()
                && pre.resource_version != stored.metadata.resource_version;
            if uid_mismatch || rv_mismatch {
                return Err(Error::Conflict {
                    namespace: key.0,
                    name: key.1,
                });
            }
        }

        if !stored.finalizers().is_empty() {
            let mut svc = stored.clone();
            if svc.metadata.deletion_timestamp.is_none() {
                svc.metadata.deletion_timestamp = Some(Time(Utc::now()));
            }
            if !opts.is_dry_run() {
                svc.metadata.resource_version = Some(objects.next_revision());
                objects.services.insert(key, svc.clone());
            }
            return Ok((svc, false));
        }

        if opts.is_dry_run() {
            return Ok((stored.clone(), true));
        }
        match objects.services.remove(&key) {
            Some(svc) => Ok((svc, true)),
            None => Err(Error::NotFound {
                namespace: key.0,
                name: key.1,
            }),
        }
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Service, Error> {
        self.objects
            .read()
            .await
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Service>, Error> {
        Ok(self
            .objects
            .read()
            .await
            .services
            .iter()
            .filter(|((ns, _), _)| namespace.map(|n| n == ns).unwrap_or(true))
            .map(|(_, svc)| svc.clone())
            .collect())
    }
}
