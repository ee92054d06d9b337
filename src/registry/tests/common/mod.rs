use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use svcalloc_ipam::{port::DEFAULT_NODE_PORT_RANGE, Allocator};
use svcalloc_registry::{
    alloc::Allocators,
    config::FeatureGate,
    error::Error,
    fixture::test_config,
    metrics::Metrics,
    rest::REST,
    service::IpFamily,
    storage::{CreateOptions, DeleteOptions, MemoryStore, Storage, UpdateOptions},
};

pub const DUAL_STACK: [&str; 2] = ["10.0.0.0/24", "fd00::/120"];
pub const SINGLE_STACK: [&str; 1] = ["10.0.0.0/24"];

pub fn rest_with<S: Storage>(store: S, ranges: &[&str], dual_stack: bool) -> REST<S> {
    let config = test_config(ranges, DEFAULT_NODE_PORT_RANGE, dual_stack);
    REST::new(
        store,
        Arc::new(Allocators::new(&config).unwrap()),
        Arc::new(FeatureGate::from(&config)),
        Metrics::new().unwrap(),
    )
}

/// Used counts of the IPv4, IPv6 and node port pools.
pub fn usage(allocators: &Allocators) -> (usize, usize, usize) {
    let ips = |family| {
        allocators
            .ip_allocator(family)
            .map(|a| a.used())
            .unwrap_or(0)
    };
    (
        ips(IpFamily::IPv4),
        ips(IpFamily::IPv6),
        allocators.node_port_allocator().used(),
    )
}

/// Rejects every write after the in-memory store accepted the read.
#[derive(Debug, Default)]
pub struct FailingStore(pub MemoryStore);

#[async_trait]
impl Storage for FailingStore {
    async fn create(&self, svc: Service, _opts: &CreateOptions) -> Result<Service, Error> {
        Err(Error::Conflict {
            namespace: svc.metadata.namespace.unwrap_or_default(),
            name: svc.metadata.name.unwrap_or_default(),
        })
    }

    async fn update(&self, svc: Service, _opts: &UpdateOptions) -> Result<Service, Error> {
        Err(Error::Conflict {
            namespace: svc.metadata.namespace.unwrap_or_default(),
            name: svc.metadata.name.unwrap_or_default(),
        })
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(Service, bool), Error> {
        self.0.delete(namespace, name, opts).await
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Service, Error> {
        self.0.get(namespace, name).await
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Service>, Error> {
        self.0.list(namespace).await
    }
}

/// Never returns from a create or an update, for cancelling requests midway.
#[derive(Debug, Default)]
pub struct StuckStore(pub MemoryStore);

#[async_trait]
impl Storage for StuckStore {
    async fn create(&self, svc: Service, opts: &CreateOptions) -> Result<Service, Error> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        self.0.create(svc, opts).await
    }

    async fn update(&self, svc: Service, opts: &UpdateOptions) -> Result<Service, Error> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        self.0.update(svc, opts).await
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(Service, bool), Error> {
        self.0.delete(namespace, name, opts).await
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Service, Error> {
        self.0.get(namespace, name).await
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Service>, Error> {
        self.0.list(namespace).await
    }
}
