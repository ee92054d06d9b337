use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::IpAddr,
    str::FromStr,
    sync::Arc,
};

use k8s_openapi::api::core::v1::{Service, ServicePort};
use kube::ResourceExt;
use svcalloc_ipam::{Allocator, IpAllocator, Operation, PortAllocator};

use crate::{
    config::Config,
    error::{allocation_error, Error, FieldError},
    family::init_ip_family_fields,
    service::{
        cluster_ips, collect_node_ports, health_check_node_port, ip_families, is_headless,
        needs_cluster_ip, needs_health_check, needs_node_port, ports, protocol, service_type,
        set_cluster_ips, should_allocate_node_ports, spec_mut, IpFamily, ServiceType,
    },
    validation::validate_upgrade_downgrade,
};

const HEALTH_CHECK_NODE_PORT_FIELD: &str = "spec.healthCheckNodePort";

/// The cluster IP pools, one per configured family, and the node port pool.
#[derive(Debug)]
pub struct Allocators {
    ips: BTreeMap<IpFamily, Arc<IpAllocator>>,
    families: Vec<IpFamily>,
    node_ports: Arc<PortAllocator>,
}

impl Allocators {
    pub fn new(config: &Config) -> Result<Allocators, Error> {
        let cidrs = config.cluster_cidrs()?;
        let node_port_range = config.node_port_range()?;

        let mut ips = BTreeMap::new();
        let mut families = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            let family = IpFamily::of_net(&cidr);
            let allocator = IpAllocator::new(cidr).map_err(Error::Ipam)?;
            tracing::info!(family=%family, range=%allocator.range(), size=allocator.size(), "service cluster IP range");
            ips.insert(family, Arc::new(allocator));
            families.push(family);
        }
        tracing::info!(range=%node_port_range, "service node port range");

        Ok(Allocators {
            ips,
            families,
            node_ports: Arc::new(PortAllocator::new(node_port_range)),
        })
    }

    /// Configured families, primary first.
    pub fn families(&self) -> &[IpFamily] {
        &self.families
    }

    pub fn primary_family(&self) -> IpFamily {
        self.families.first().copied().unwrap_or(IpFamily::IPv4)
    }

    pub fn is_dual_stack(&self) -> bool {
        self.families.len() == 2
    }

    pub fn ip_allocator(&self, family: IpFamily) -> Option<&Arc<IpAllocator>> {
        self.ips.get(&family)
    }

    pub fn node_port_allocator(&self) -> &Arc<PortAllocator> {
        &self.node_ports
    }

    pub fn begin(&self, dry_run: bool) -> Transaction {
        Transaction {
            dry_run,
            ips: self
                .ips
                .iter()
                .map(|(family, allocator)| (*family, Operation::start(allocator.clone(), dry_run)))
                .collect(),
            node_ports: Operation::start(self.node_ports.clone(), dry_run),
        }
    }

    /// Resolves the family fields of a new Service and allocates everything it
    /// needs. The returned transaction holds the allocations until it is
    /// committed or dropped.
    pub fn allocate_create(
        &self,
        svc: &mut Service,
        dual_stack: bool,
        dry_run: bool,
    ) -> Result<Transaction, Error> {
        init_ip_family_fields(svc, None, &self.families, dual_stack)?;

        let name = svc.name_any();
        let mut txn = self.begin(dry_run);

        if needs_cluster_ip(svc) && !is_headless(svc) {
            let families = ip_families(svc);
            let requested = cluster_ips(svc).to_vec();
            let ips = txn.allocate_cluster_ips(&name, &families, &requested, 0)?;
            set_cluster_ips(svc, ips);
        }
        if needs_node_port(svc) {
            txn.init_node_ports(&name, svc)?;
        }
        if needs_health_check(svc) {
            txn.allocate_health_check_node_port(&name, svc)?;
        }
        Ok(txn)
    }

    /// Moves the allocations of `old` to what `svc` needs. Releases are
    /// deferred to the commit of the returned transaction.
    pub fn allocate_update(
        &self,
        svc: &mut Service,
        old: &Service,
        dual_stack: bool,
        dry_run: bool,
    ) -> Result<Transaction, Error> {
        init_ip_family_fields(svc, Some(old), &self.families, dual_stack)?;

        let name = svc.name_any();
        validate_upgrade_downgrade(svc, old).into_result(&name)?;

        let mut txn = self.begin(dry_run);
        txn.update_cluster_ips(&name, svc, old)?;

        match (needs_node_port(old), needs_node_port(svc)) {
            (false, true) => txn.init_node_ports(&name, svc)?,
            (true, true) => txn.update_node_ports(&name, svc, old)?,
            (true, false) => {
                for port in collect_node_ports(old) {
                    txn.node_ports.release_deferred(port);
                }
            }
            (false, false) => {}
        }

        txn.update_health_check_node_port(&name, svc, old)?;
        Ok(txn)
    }

    /// Returns every value held by `svc` to the pools right away.
    pub fn release_allocated_resources(&self, svc: &Service) {
        if needs_cluster_ip(svc) && !is_headless(svc) {
            for ip in cluster_ips(svc) {
                let released = parse_ip(ip).and_then(|addr| {
                    self.ips
                        .get(&IpFamily::of(&addr))
                        .map(|allocator| allocator.release(addr))
                });
                match released {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        tracing::error!(error=?e, ip, name=svc.name_any(), "failed to release cluster IP")
                    }
                    None => {
                        tracing::warn!(ip, name=svc.name_any(), "cluster IP does not belong to any configured range")
                    }
                }
            }
        }

        for port in collect_node_ports(svc) {
            if let Err(e) = self.node_ports.release(port) {
                tracing::error!(error=?e, port, name=svc.name_any(), "failed to release node port");
            }
        }

        if needs_health_check(svc) {
            let port = health_check_node_port(svc);
            if port > 0 {
                if let Err(e) = self.node_ports.release(port) {
                    tracing::error!(error=?e, port, name=svc.name_any(), "failed to release health check node port");
                }
            }
        }
    }
}

/// Allocations made on behalf of one request.
///
/// Dropping a transaction without committing it reverts every allocation.
#[derive(Debug)]
pub struct Transaction {
    dry_run: bool,
    ips: BTreeMap<IpFamily, Operation<IpAllocator>>,
    node_ports: Operation<PortAllocator>,
}

impl Transaction {
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn allocated_cluster_ips(&self) -> Vec<IpAddr> {
        self.ips
            .values()
            .flat_map(|op| op.allocated().iter().copied())
            .collect()
    }

    pub fn allocated_node_ports(&self) -> &[i32] {
        self.node_ports.allocated()
    }

    pub fn commit(self) {
        let Transaction {
            dry_run,
            ips,
            node_ports,
        } = self;

        let mut allocated_ips = Vec::new();
        let mut released_ips = Vec::new();
        for (family, op) in ips {
            allocated_ips.extend(op.allocated().iter().map(|ip| ip.to_string()));
            released_ips.extend(op.deferred().iter().map(|ip| ip.to_string()));
            for (ip, e) in op.commit() {
                tracing::error!(error=?e, ip=%ip, family=%family, "failed to release cluster IP");
            }
        }

        let allocated_ports = node_ports.allocated().to_vec();
        let released_ports = node_ports.deferred().to_vec();
        for (port, e) in node_ports.commit() {
            tracing::error!(error=?e, port, "failed to release node port");
        }

        if dry_run {
            return;
        }
        if !(allocated_ips.is_empty()
            && released_ips.is_empty()
            && allocated_ports.is_empty()
            && released_ports.is_empty())
        {
            tracing::info!(
                cluster_ips=?allocated_ips,
                node_ports=?allocated_ports,
                released_cluster_ips=?released_ips,
                released_node_ports=?released_ports,
                "committed allocations"
            );
        }
    }

    // `offset` is the index of `families[0]` in spec.clusterIPs, used for error paths.
    fn allocate_cluster_ips(
        &mut self,
        name: &str,
        families: &[IpFamily],
        requested: &[String],
        offset: usize,
    ) -> Result<Vec<String>, Error> {
        let mut allocated = Vec::with_capacity(families.len());
        for (i, family) in families.iter().enumerate() {
            let field = format!("spec.clusterIPs[{}]", i + offset);
            let Some(op) = self.ips.get_mut(family) else {
                return Err(Error::invalid(
                    name,
                    FieldError::invalid(
                        format!("spec.ipFamilies[{}]", i + offset),
                        family.as_str(),
                        "not configured on this cluster",
                    ),
                ));
            };
            let addr = match requested.get(i).map(String::as_str) {
                Some(ip) if !ip.is_empty() => {
                    let addr = parse_ip(ip).ok_or_else(|| {
                        Error::invalid(
                            name,
                            FieldError::invalid(field.clone(), ip, "must be a valid IP address"),
                        )
                    })?;
                    op.allocate(addr)
                        .map_err(|e| allocation_error(name, field, ip, e))?;
                    addr
                }
                _ => op
                    .allocate_next()
                    .map_err(|e| allocation_error(name, field, "", e))?,
            };
            allocated.push(addr.to_string());
        }
        Ok(allocated)
    }

    fn release_cluster_ip_deferred(&mut self, name: &str, ip: &str) {
        let Some(addr) = parse_ip(ip) else {
            tracing::warn!(ip, name, "skip releasing malformed cluster IP");
            return;
        };
        match self.ips.get_mut(&IpFamily::of(&addr)) {
            Some(op) => op.release_deferred(addr),
            None => tracing::warn!(ip, name, "cluster IP does not belong to any configured range"),
        }
    }

    fn update_cluster_ips(&mut self, name: &str, svc: &mut Service, old: &Service) -> Result<(), Error> {
        let old_type = service_type(old);
        let new_type = service_type(svc);

        if old_type == ServiceType::ExternalName && new_type != ServiceType::ExternalName {
            if is_headless(svc) {
                return Ok(());
            }
            let families = ip_families(svc);
            let requested = cluster_ips(svc).to_vec();
            let ips = self.allocate_cluster_ips(name, &families, &requested, 0)?;
            set_cluster_ips(svc, ips);
            return Ok(());
        }

        if is_headless(old) {
            return Ok(());
        }

        if new_type == ServiceType::ExternalName {
            for ip in cluster_ips(old) {
                self.release_cluster_ip_deferred(name, ip);
            }
            return Ok(());
        }

        let old_ips = cluster_ips(old);
        let families = ip_families(svc);
        if old_ips.len() < families.len() {
            // upgrade
            let requested = cluster_ips(svc)
                .get(old_ips.len()..)
                .unwrap_or(&[])
                .to_vec();
            let allocated =
                self.allocate_cluster_ips(name, &families[old_ips.len()..], &requested, old_ips.len())?;
            let mut ips = old_ips.to_vec();
            ips.extend(allocated);
            set_cluster_ips(svc, ips);
        } else if old_ips.len() > cluster_ips(svc).len() {
            // downgrade
            let keep = cluster_ips(svc).len();
            for ip in &old_ips[keep..] {
                self.release_cluster_ip_deferred(name, ip);
            }
        }
        Ok(())
    }

    fn init_node_ports(&mut self, name: &str, svc: &mut Service) -> Result<(), Error> {
        let allocate_blank = should_allocate_node_ports(svc);
        let requested_ports = ports(svc).to_vec();
        // service port -> node port, ports differing only by protocol share one
        let mut by_port: HashMap<i32, i32> = HashMap::new();

        let Some(svc_ports) = spec_mut(svc).ports.as_mut() else {
            return Ok(());
        };
        for (i, sp) in svc_ports.iter_mut().enumerate() {
            let requested = sp.node_port.unwrap_or(0);
            if requested == 0 && !allocate_blank {
                continue;
            }
            let field = format!("spec.ports[{i}].nodePort");
            match by_port.get(&sp.port).copied() {
                None => {
                    let port = match find_requested_node_port(sp.port, &requested_ports) {
                        0 => self
                            .node_ports
                            .allocate_next()
                            .map_err(|e| allocation_error(name, field, 0, e))?,
                        port => {
                            self.node_ports
                                .allocate(port)
                                .map_err(|e| allocation_error(name, field, port, e))?;
                            port
                        }
                    };
                    sp.node_port = Some(port);
                    by_port.insert(sp.port, port);
                }
                Some(shared) if requested == 0 => sp.node_port = Some(shared),
                Some(shared) if requested != shared => {
                    self.node_ports
                        .allocate(requested)
                        .map_err(|e| allocation_error(name, field, requested, e))?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn update_node_ports(&mut self, name: &str, svc: &mut Service, old: &Service) -> Result<(), Error> {
        let old_node_ports = collect_node_ports(old);
        let allocate_blank = should_allocate_node_ports(svc);
        let requested_ports = ports(svc).to_vec();
        let mut by_port: HashMap<i32, i32> = HashMap::new();
        let mut used: HashSet<(String, i32)> = HashSet::new();

        if let Some(svc_ports) = spec_mut(svc).ports.as_mut() {
            for (i, sp) in svc_ports.iter_mut().enumerate() {
                let requested = sp.node_port.unwrap_or(0);
                if requested == 0 && !allocate_blank {
                    continue;
                }
                let field = format!("spec.ports[{i}].nodePort");
                let port = if requested != 0 {
                    self.claim_node_port(name, &field, requested, &old_node_ports)?;
                    requested
                } else {
                    match find_requested_node_port(sp.port, &requested_ports) {
                        0 => match by_port.get(&sp.port).copied() {
                            Some(shared) => shared,
                            None => self
                                .node_ports
                                .allocate_next()
                                .map_err(|e| allocation_error(name, field.clone(), 0, e))?,
                        },
                        port => {
                            self.claim_node_port(name, &field, port, &old_node_ports)?;
                            port
                        }
                    }
                };
                sp.node_port = Some(port);
                by_port.entry(sp.port).or_insert(port);

                if !used.insert((protocol(sp).to_string(), port)) {
                    return Err(Error::invalid(name, FieldError::duplicate(field, port)));
                }
            }
        }

        let new_node_ports = collect_node_ports(svc);
        for port in old_node_ports {
            if !new_node_ports.contains(&port) {
                self.node_ports.release_deferred(port);
            }
        }
        Ok(())
    }

    // Ports already held by the old object or claimed earlier in this
    // transaction are reused as they are.
    fn claim_node_port(
        &mut self,
        name: &str,
        field: &str,
        port: i32,
        old_node_ports: &[i32],
    ) -> Result<(), Error> {
        if old_node_ports.contains(&port) || self.node_ports.allocated().contains(&port) {
            return Ok(());
        }
        self.node_ports
            .allocate(port)
            .map_err(|e| allocation_error(name, field.to_string(), port, e))
    }

    fn allocate_health_check_node_port(&mut self, name: &str, svc: &mut Service) -> Result<(), Error> {
        let requested = health_check_node_port(svc);
        let field = HEALTH_CHECK_NODE_PORT_FIELD.to_string();
        let port = if requested > 0 {
            self.node_ports
                .allocate(requested)
                .map_err(|e| allocation_error(name, field, requested, e))?;
            requested
        } else {
            self.node_ports
                .allocate_next()
                .map_err(|e| allocation_error(name, field, 0, e))?
        };
        spec_mut(svc).health_check_node_port = Some(port);
        Ok(())
    }

    fn update_health_check_node_port(
        &mut self,
        name: &str,
        svc: &mut Service,
        old: &Service,
    ) -> Result<(), Error> {
        match (needs_health_check(old), needs_health_check(svc)) {
            (false, true) => self.allocate_health_check_node_port(name, svc),
            (true, false) => {
                let port = health_check_node_port(old);
                if port > 0 {
                    self.node_ports.release_deferred(port);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn parse_ip(ip: &str) -> Option<IpAddr> {
    IpAddr::from_str(ip).ok()
}

/// The first explicit node port among the service ports serving `port`.
fn find_requested_node_port(port: i32, svc_ports: &[ServicePort]) -> i32 {
    svc_ports
        .iter()
        .filter(|sp| sp.port == port)
        .find_map(|sp| sp.node_port.filter(|np| *np != 0))
        .unwrap_or(0)
}
