use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use crate::{
    alloc::Allocators,
    config::FeatureGate,
    error::Error,
    family::{same_cluster_ips, same_ip_families},
    metrics::Metrics,
    service::{
        cluster_ip, cluster_ips, collect_node_ports, health_check_node_port, needs_cluster_ip,
        needs_external_traffic_policy, needs_health_check, needs_node_port, ports, service_type,
        set_defaults, spec_mut, ServiceType, DEFAULT_NAMESPACE,
    },
    storage::{CreateOptions, DeleteOptions, Storage, UpdateOptions},
    validation::{validate_service, validate_service_update},
};

/// Service storage that allocates cluster IPs and node ports for the objects
/// it persists.
#[derive(Debug)]
pub struct REST<S: Storage> {
    store: S,
    allocators: Arc<Allocators>,
    features: Arc<FeatureGate>,
    metrics: Metrics,
}

impl<S: Storage> REST<S> {
    pub fn new(
        store: S,
        allocators: Arc<Allocators>,
        features: Arc<FeatureGate>,
        metrics: Metrics,
    ) -> REST<S> {
        REST {
            store,
            allocators,
            features,
            metrics,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn allocators(&self) -> &Arc<Allocators> {
        &self.allocators
    }

    pub fn features(&self) -> &Arc<FeatureGate> {
        &self.features
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    #[tracing::instrument(skip_all, fields(name = svc.name_any()))]
    pub async fn create(&self, svc: Service, opts: &CreateOptions) -> Result<Service, Error> {
        let res = self.create_service(svc, opts).await;
        self.observe("create", &res);
        res
    }

    /// Updates a Service. The returned flag is true when the Service did not
    /// exist and was created instead, which requires `force_allow_create`.
    #[tracing::instrument(skip_all, fields(name = svc.name_any()))]
    pub async fn update(
        &self,
        svc: Service,
        force_allow_create: bool,
        opts: &UpdateOptions,
    ) -> Result<(Service, bool), Error> {
        let res = self.update_service(svc, force_allow_create, opts).await;
        self.observe("update", &res);
        res
    }

    /// Deletes a Service. The returned flag is false while finalizers keep
    /// the object around; its allocations are held until it is really gone.
    #[tracing::instrument(skip(self, opts))]
    pub async fn delete(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(Service, bool), Error> {
        let res = self.store.delete(namespace, name, opts).await;
        if let Ok((svc, true)) = &res {
            if !opts.is_dry_run() {
                self.allocators.release_allocated_resources(svc);
                tracing::info!(
                    namespace,
                    name,
                    cluster_ips=?cluster_ips(svc),
                    node_ports=?collect_node_ports(svc),
                    "released allocations of deleted Service"
                );
            }
        }
        self.observe("delete", &res);
        res
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<Service, Error> {
        self.store.get(namespace, name).await
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<Service>, Error> {
        self.store.list(namespace).await
    }

    fn observe<T>(&self, operation: &str, res: &Result<T, Error>) {
        if let Err(e) = res {
            tracing::warn!(error=%e, operation, "Service operation failed");
        }
        self.metrics.operation(operation, res);
        self.metrics.observe_allocators(&self.allocators);
    }

    async fn create_service(&self, mut svc: Service, opts: &CreateOptions) -> Result<Service, Error> {
        let dual_stack = self.features.dual_stack();
        let dry_run = opts.is_dry_run();

        set_defaults(&mut svc);
        drop_disabled_fields(&mut svc, None, dual_stack);
        normalize_cluster_ips(&mut svc, None);
        let name = svc.name_any();
        validate_service(&svc).into_result(&name)?;

        let txn = self
            .allocators
            .allocate_create(&mut svc, dual_stack, dry_run)?;
        // an error or a dropped future from here on reverts the transaction
        let created = self.store.create(svc, opts).await?;
        txn.commit();

        tracing::info!(
            namespace = created.namespace(),
            name,
            dry_run,
            cluster_ips=?cluster_ips(&created),
            node_ports=?collect_node_ports(&created),
            health_check_node_port = health_check_node_port(&created),
            "created Service"
        );
        Ok(created)
    }

    async fn update_service(
        &self,
        mut svc: Service,
        force_allow_create: bool,
        opts: &UpdateOptions,
    ) -> Result<(Service, bool), Error> {
        let dual_stack = self.features.dual_stack();
        let dry_run = opts.is_dry_run();
        let namespace = svc
            .namespace()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let name = svc.name_any();

        let old = match self.store.get(&namespace, &name).await {
            Ok(old) => old,
            Err(e) if e.is_not_found() && force_allow_create => {
                let opts = CreateOptions {
                    dry_run: opts.dry_run.clone(),
                };
                let created = self.create_service(svc, &opts).await?;
                return Ok((created, true));
            }
            Err(e) => return Err(e),
        };

        set_defaults(&mut svc);
        if svc.metadata.resource_version.is_none() {
            svc.metadata.resource_version = old.metadata.resource_version.clone();
        }
        svc.metadata.deletion_timestamp = old.metadata.deletion_timestamp.clone();

        drop_disabled_fields(&mut svc, Some(&old), dual_stack);
        patch_allocated_values(&mut svc, &old);
        normalize_cluster_ips(&mut svc, Some(&old));
        drop_type_dependent_fields(&mut svc, &old);
        validate_service_update(&svc, &old).into_result(&name)?;

        let txn = self
            .allocators
            .allocate_update(&mut svc, &old, dual_stack, dry_run)?;
        let updated = self.store.update(svc, opts).await?;
        txn.commit();

        tracing::info!(
            namespace,
            name,
            dry_run,
            cluster_ips=?cluster_ips(&updated),
            node_ports=?collect_node_ports(&updated),
            health_check_node_port = health_check_node_port(&updated),
            "updated Service"
        );
        Ok((updated, false))
    }
}

/// Clears ipFamilyPolicy and ipFamilies while dual-stack is off, unless the
/// stored object already carries them.
pub fn drop_disabled_fields(svc: &mut Service, old: Option<&Service>, dual_stack: bool) {
    if dual_stack || old.map(dual_stack_fields_in_use).unwrap_or(false) {
        return;
    }
    if let Some(spec) = svc.spec.as_mut() {
        spec.ip_family_policy = None;
        spec.ip_families = None;
    }
}

fn dual_stack_fields_in_use(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .map(|s| {
            s.ip_family_policy.is_some()
                || s.ip_families.as_ref().map(|f| !f.is_empty()).unwrap_or(false)
        })
        .unwrap_or(false)
}

/// Keeps clusterIP and clusterIPs in sync when the caller only set one of them.
pub fn normalize_cluster_ips(svc: &mut Service, old: Option<&Service>) {
    let ip = cluster_ip(svc).to_string();
    let ips = cluster_ips(svc).to_vec();

    if ip.is_empty() && ips.is_empty() {
        return;
    }
    if !ip.is_empty() && ips.is_empty() {
        spec_mut(svc).cluster_ips = Some(vec![ip]);
        return;
    }
    let Some(old) = old else {
        return;
    };

    // clusterIP was cleared and clusterIPs left as they were
    if ip.is_empty() && cluster_ips(old) == ips.as_slice() {
        spec_mut(svc).cluster_ips = None;
        return;
    }
    // clusterIP was changed and clusterIPs left as they were
    let old_ip = cluster_ip(old);
    if !old_ip.is_empty() && !ip.is_empty() && old_ip != ip && cluster_ips(old) == ips.as_slice() {
        spec_mut(svc).cluster_ips = Some(vec![ip]);
    }
}

/// Copies allocated values the caller left blank from the stored object.
pub fn patch_allocated_values(svc: &mut Service, old: &Service) {
    if needs_cluster_ip(old) && needs_cluster_ip(svc) {
        let spec = spec_mut(svc);
        let old_spec = old.spec.as_ref();
        if spec.cluster_ip.as_deref().unwrap_or("").is_empty() {
            spec.cluster_ip = old_spec.and_then(|s| s.cluster_ip.clone());
        }
        if spec.cluster_ips.as_ref().map(|ips| ips.is_empty()).unwrap_or(true)
            && !cluster_ips(old).is_empty()
        {
            spec.cluster_ips = old_spec.and_then(|s| s.cluster_ips.clone());
        }
    }

    if needs_node_port(old) && needs_node_port(svc) {
        let old_used = node_ports_in_use(old);
        let new_used = node_ports_in_use(svc);
        // ports that are still referenced can not be handed to another port
        let used = old_used
            .intersection(&new_used)
            .copied()
            .collect::<BTreeSet<i32>>();
        let by_name = ports(old)
            .iter()
            .map(|p| (p.name.clone().unwrap_or_default(), p.node_port.unwrap_or(0)))
            .collect::<HashMap<String, i32>>();

        if let Some(svc_ports) = spec_mut(svc).ports.as_mut() {
            for p in svc_ports.iter_mut() {
                if p.node_port.unwrap_or(0) != 0 {
                    continue;
                }
                let name = p.name.clone().unwrap_or_default();
                match by_name.get(&name) {
                    Some(old_value) if *old_value != 0 && !used.contains(old_value) => {
                        p.node_port = Some(*old_value)
                    }
                    _ => {}
                }
            }
        }
    }

    if needs_health_check(old) && needs_health_check(svc) && health_check_node_port(svc) == 0 {
        spec_mut(svc).health_check_node_port = old.spec.as_ref().and_then(|s| s.health_check_node_port);
    }
}

fn node_ports_in_use(svc: &Service) -> BTreeSet<i32> {
    ports(svc)
        .iter()
        .filter_map(|p| p.node_port)
        .filter(|np| *np != 0)
        .collect()
}

/// Clears fields that no longer apply to the new type, as long as the caller
/// did not change them.
pub fn drop_type_dependent_fields(svc: &mut Service, old: &Service) {
    if needs_cluster_ip(old) && !needs_cluster_ip(svc) {
        let same_ips = same_cluster_ips(old, svc) && cluster_ip(old) == cluster_ip(svc);
        let same_families = same_ip_families(old, svc);
        let same_policy = old.spec.as_ref().and_then(|s| s.ip_family_policy.as_ref())
            == svc.spec.as_ref().and_then(|s| s.ip_family_policy.as_ref());
        let spec = spec_mut(svc);
        if same_ips {
            spec.cluster_ip = None;
            spec.cluster_ips = None;
        }
        if same_families {
            spec.ip_families = None;
        }
        if same_policy {
            spec.ip_family_policy = None;
        }
    }

    if needs_node_port(old) && !needs_node_port(svc) && same_node_ports(old, svc) {
        if let Some(svc_ports) = spec_mut(svc).ports.as_mut() {
            for p in svc_ports.iter_mut() {
                p.node_port = None;
            }
        }
    }

    if needs_health_check(old)
        && !needs_health_check(svc)
        && health_check_node_port(old) == health_check_node_port(svc)
    {
        spec_mut(svc).health_check_node_port = None;
    }

    if service_type(old) == ServiceType::LoadBalancer && service_type(svc) != ServiceType::LoadBalancer {
        let old_value = old
            .spec
            .as_ref()
            .and_then(|s| s.allocate_load_balancer_node_ports);
        let spec = spec_mut(svc);
        if old_value.is_some() && spec.allocate_load_balancer_node_ports == old_value {
            spec.allocate_load_balancer_node_ports = None;
        }
    }

    if needs_external_traffic_policy(old) && !needs_external_traffic_policy(svc) {
        let old_value = old
            .spec
            .as_ref()
            .and_then(|s| s.external_traffic_policy.clone());
        let spec = spec_mut(svc);
        if spec.external_traffic_policy == old_value {
            spec.external_traffic_policy = None;
        }
    }
}

fn same_node_ports(old: &Service, svc: &Service) -> bool {
    let old_ports = ports(old);
    let new_ports = ports(svc);
    old_ports.len() == new_ports.len()
        && old_ports
            .iter()
            .zip(new_ports.iter())
            .all(|(o, n)| o.node_port.unwrap_or(0) == n.node_port.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::*;
    use rstest::rstest;

    #[rstest(
        svc,
        old,
        expected_ip,
        expected_ips,
        case(make_service("a", vec![]), None, "", vec![]),
        case(
            {
                let mut svc = make_service("a", vec![]);
                spec_mut(&mut svc).cluster_ip = Some("10.0.0.1".to_string());
                svc
            },
            None, "10.0.0.1", vec!["10.0.0.1"]
        ),
        case(
            {
                let mut svc = make_service("a", vec![set_cluster_ip_list(&["10.0.0.1", "fd00::1"])]);
                spec_mut(&mut svc).cluster_ip = None;
                svc
            },
            Some(make_service("a", vec![set_cluster_ip_list(&["10.0.0.1", "fd00::1"])])),
            "", vec![]
        ),
        case(
            {
                let mut svc = make_service("a", vec![set_cluster_ip_list(&["10.0.0.1", "fd00::1"])]);
                spec_mut(&mut svc).cluster_ip = Some("10.0.0.2".to_string());
                svc
            },
            Some(make_service("a", vec![set_cluster_ip_list(&["10.0.0.1", "fd00::1"])])),
            "10.0.0.2", vec!["10.0.0.2"]
        )
    )]
    fn works_normalize_cluster_ips(
        svc: Service,
        old: Option<Service>,
        expected_ip: &str,
        expected_ips: Vec<&str>,
    ) {
        let mut svc = svc;
        normalize_cluster_ips(&mut svc, old.as_ref());
        assert_eq!(cluster_ip(&svc), expected_ip);
        assert_eq!(cluster_ips(&svc), expected_ips);
    }

    #[test]
    fn works_patch_allocated_values() {
        let old = make_service(
            "a",
            vec![
                set_type_load_balancer(),
                set_external_traffic_policy("Local"),
                set_health_check_node_port(30100),
                set_cluster_ip_list(&["10.0.0.1"]),
                set_ports(vec![
                    make_service_port("p", 80, "TCP", 30080),
                    make_service_port("q", 81, "TCP", 30081),
                ]),
            ],
        );
        // q took over the node port of p, p is blank
        let mut svc = make_service(
            "a",
            vec![
                set_type_load_balancer(),
                set_external_traffic_policy("Local"),
                set_ports(vec![
                    make_service_port("q", 81, "TCP", 30080),
                    make_service_port("p", 80, "TCP", 0),
                    make_service_port("r", 82, "TCP", 0),
                ]),
            ],
        );
        patch_allocated_values(&mut svc, &old);

        assert_eq!(cluster_ips(&svc), &["10.0.0.1".to_string()]);
        assert_eq!(cluster_ip(&svc), "10.0.0.1");
        assert_eq!(health_check_node_port(&svc), 30100);
        let node_ports = ports(&svc)
            .iter()
            .map(|p| p.node_port.unwrap_or(0))
            .collect::<Vec<i32>>();
        assert_eq!(node_ports, vec![30080, 0, 0]);
    }

    #[test]
    fn works_drop_type_dependent_fields() {
        let old = make_service(
            "a",
            vec![
                set_type_load_balancer(),
                set_external_traffic_policy("Local"),
                set_health_check_node_port(30100),
                set_cluster_ip_list(&["10.0.0.1"]),
                set_ip_families(&["IPv4"]),
                set_ip_family_policy("SingleStack"),
                set_node_ports(&[30080]),
            ],
        );

        let mut svc = old.clone();
        spec_mut(&mut svc).type_ = Some("ExternalName".to_string());
        spec_mut(&mut svc).external_name = Some("foo.example.com".to_string());
        drop_type_dependent_fields(&mut svc, &old);

        let spec = svc.spec.as_ref().unwrap();
        assert!(spec.cluster_ip.is_none());
        assert!(spec.cluster_ips.is_none());
        assert!(spec.ip_families.is_none());
        assert!(spec.ip_family_policy.is_none());
        assert!(ports(&svc).iter().all(|p| p.node_port.is_none()));
        assert!(spec.health_check_node_port.is_none());
        assert!(spec.allocate_load_balancer_node_ports.is_none());
        assert!(spec.external_traffic_policy.is_none());
        assert!(validate_service(&svc).is_empty());
    }

    #[test]
    fn works_drop_type_dependent_fields_keeps_changed_values() {
        let old = make_service(
            "a",
            vec![set_type_node_port(), set_node_ports(&[30080])],
        );
        let mut svc = old.clone();
        set_type_cluster_ip()(&mut svc);
        set_node_ports(&[30081])(&mut svc);
        drop_type_dependent_fields(&mut svc, &old);

        // the caller asked for a node port, validation reports it
        assert_eq!(ports(&svc)[0].node_port, Some(30081));
        assert!(!validate_service(&svc).is_empty());
    }

    #[rstest(
        svc,
        old,
        dual_stack,
        expected_kept,
        case(
            make_service("a", vec![set_type_external_name(), set_ip_family_policy("PreferDualStack")]),
            None, false, false
        ),
        case(
            make_service("a", vec![set_ip_families(&["IPv6"]), set_cluster_ip_list(&["10.0.0.5"])]),
            None, false, false
        ),
        case(
            make_service("a", vec![set_ip_family_policy("PreferDualStack")]),
            None, true, true
        ),
        case(
            make_service("a", vec![set_ip_family_policy("PreferDualStack")]),
            Some(make_service("a", vec![set_ip_family_policy("SingleStack")])),
            false, true
        ),
        case(
            make_service("a", vec![set_ip_family_policy("PreferDualStack")]),
            Some(make_service("a", vec![set_type_external_name()])),
            false, false
        )
    )]
    fn works_drop_disabled_fields(
        svc: Service,
        old: Option<Service>,
        dual_stack: bool,
        expected_kept: bool,
    ) {
        let mut svc = svc;
        let before = svc.clone();
        drop_disabled_fields(&mut svc, old.as_ref(), dual_stack);
        if expected_kept {
            assert_eq!(svc, before);
        } else {
            let spec = svc.spec.as_ref().unwrap();
            assert_eq!(spec.ip_family_policy, None);
            assert_eq!(spec.ip_families, None);
            assert!(validate_service(&svc).is_empty());
        }
    }
}
