use std::{net::IpAddr, str::FromStr, sync::Arc};

use kube::ResourceExt;
use svcalloc_ipam::{error::Error as IpamError, Allocator};

use crate::{
    alloc::Allocators,
    error::Error,
    service::{
        cluster_ips, collect_node_ports, health_check_node_port, is_headless, needs_cluster_ip,
        needs_health_check, IpFamily,
    },
    storage::Storage,
};

/// Outcome of one repair pass. Problems are reported as `value (namespace/name)`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub services: usize,
    pub marked: usize,
    pub duplicates: Vec<String>,
    pub out_of_range: Vec<String>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty() && self.out_of_range.is_empty()
    }
}

/// Rebuilds the in-memory pools from persisted Services.
#[derive(Debug)]
pub struct Repair {
    allocators: Arc<Allocators>,
}

impl Repair {
    pub fn new(allocators: Arc<Allocators>) -> Repair {
        Repair { allocators }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run_once<S: Storage>(&self, store: &S) -> Result<RepairReport, Error> {
        let services = store.list(None).await?;
        let mut report = RepairReport {
            services: services.len(),
            ..Default::default()
        };

        for svc in services.iter() {
            let key = format!(
                "{}/{}",
                svc.namespace().unwrap_or_default(),
                svc.name_any()
            );
            if needs_cluster_ip(svc) && !is_headless(svc) {
                for ip in cluster_ips(svc) {
                    self.mark_cluster_ip(&mut report, &key, ip)?;
                }
            }
            let mut node_ports = collect_node_ports(svc);
            if needs_health_check(svc) && health_check_node_port(svc) > 0 {
                node_ports.push(health_check_node_port(svc));
            }
            for port in node_ports {
                let res = self.allocators.node_port_allocator().allocate(port);
                record(&mut report, &key, &port.to_string(), res)?;
            }
        }

        if report.is_clean() {
            tracing::info!(services = report.services, marked = report.marked, "repaired allocators");
        } else {
            tracing::warn!(
                services = report.services,
                marked = report.marked,
                duplicates=?report.duplicates,
                out_of_range=?report.out_of_range,
                "repaired allocators with inconsistencies"
            );
        }
        Ok(report)
    }

    fn mark_cluster_ip(&self, report: &mut RepairReport, key: &str, ip: &str) -> Result<(), Error> {
        let Ok(addr) = IpAddr::from_str(ip) else {
            report.out_of_range.push(format!("{ip} ({key})"));
            return Ok(());
        };
        match self.allocators.ip_allocator(IpFamily::of(&addr)) {
            Some(allocator) => record(report, key, ip, allocator.allocate(addr)),
            None => {
                report.out_of_range.push(format!("{ip} ({key})"));
                Ok(())
            }
        }
    }
}

fn record(
    report: &mut RepairReport,
    key: &str,
    value: &str,
    res: Result<(), IpamError>,
) -> Result<(), Error> {
    match res {
        Ok(()) => report.marked += 1,
        Err(IpamError::AlreadyAllocated(_)) => report.duplicates.push(format!("{value} ({key})")),
        Err(IpamError::OutOfRange { .. }) | Err(IpamError::ProtocolMismatch(_)) => {
            report.out_of_range.push(format!("{value} ({key})"))
        }
        Err(e) => return Err(Error::Ipam(e)),
    }
    Ok(())
}
