use std::{collections::BTreeSet, fmt::Display, net::IpAddr, str::FromStr};

use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use thiserror::Error;

pub const CLUSTER_IP_NONE: &str = "None";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const PROTOCOL_TCP: &str = "TCP";
pub const SUPPORTED_PROTOCOLS: [&str; 3] = ["SCTP", "TCP", "UDP"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported value: {0}")]
pub struct UnsupportedValue(pub String);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl ServiceType {
    pub const SUPPORTED: [&'static str; 4] =
        ["ClusterIP", "ExternalName", "LoadBalancer", "NodePort"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::ExternalName => "ExternalName",
        }
    }
}

impl FromStr for ServiceType {
    type Err = UnsupportedValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ClusterIP" => Ok(ServiceType::ClusterIP),
            "NodePort" => Ok(ServiceType::NodePort),
            "LoadBalancer" => Ok(ServiceType::LoadBalancer),
            "ExternalName" => Ok(ServiceType::ExternalName),
            _ => Err(UnsupportedValue(s.to_string())),
        }
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpFamily {
    IPv4,
    IPv6,
}

impl IpFamily {
    pub const SUPPORTED: [&'static str; 2] = ["IPv4", "IPv6"];

    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::IPv4 => "IPv4",
            IpFamily::IPv6 => "IPv6",
        }
    }

    pub fn of(addr: &IpAddr) -> IpFamily {
        match addr {
            IpAddr::V4(_) => IpFamily::IPv4,
            IpAddr::V6(_) => IpFamily::IPv6,
        }
    }

    pub fn of_net(net: &IpNet) -> IpFamily {
        match net {
            IpNet::V4(_) => IpFamily::IPv4,
            IpNet::V6(_) => IpFamily::IPv6,
        }
    }

    /// Family of a textual address, `None` when it is not an address.
    pub fn of_str(ip: &str) -> Option<IpFamily> {
        IpAddr::from_str(ip).ok().map(|a| IpFamily::of(&a))
    }

    pub fn other(&self) -> IpFamily {
        match self {
            IpFamily::IPv4 => IpFamily::IPv6,
            IpFamily::IPv6 => IpFamily::IPv4,
        }
    }
}

impl FromStr for IpFamily {
    type Err = UnsupportedValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IPv4" => Ok(IpFamily::IPv4),
            "IPv6" => Ok(IpFamily::IPv6),
            _ => Err(UnsupportedValue(s.to_string())),
        }
    }
}

impl Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamilyPolicy {
    SingleStack,
    PreferDualStack,
    RequireDualStack,
}

impl IpFamilyPolicy {
    pub const SUPPORTED: [&'static str; 3] = ["PreferDualStack", "RequireDualStack", "SingleStack"];

    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamilyPolicy::SingleStack => "SingleStack",
            IpFamilyPolicy::PreferDualStack => "PreferDualStack",
            IpFamilyPolicy::RequireDualStack => "RequireDualStack",
        }
    }
}

impl FromStr for IpFamilyPolicy {
    type Err = UnsupportedValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SingleStack" => Ok(IpFamilyPolicy::SingleStack),
            "PreferDualStack" => Ok(IpFamilyPolicy::PreferDualStack),
            "RequireDualStack" => Ok(IpFamilyPolicy::RequireDualStack),
            _ => Err(UnsupportedValue(s.to_string())),
        }
    }
}

impl Display for IpFamilyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalTrafficPolicy {
    Cluster,
    Local,
}

impl ExternalTrafficPolicy {
    pub const SUPPORTED: [&'static str; 2] = ["Cluster", "Local"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalTrafficPolicy::Cluster => "Cluster",
            ExternalTrafficPolicy::Local => "Local",
        }
    }
}

impl FromStr for ExternalTrafficPolicy {
    type Err = UnsupportedValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Cluster" => Ok(ExternalTrafficPolicy::Cluster),
            "Local" => Ok(ExternalTrafficPolicy::Local),
            _ => Err(UnsupportedValue(s.to_string())),
        }
    }
}

impl Display for ExternalTrafficPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn spec_mut(svc: &mut Service) -> &mut ServiceSpec {
    svc.spec.get_or_insert_with(ServiceSpec::default)
}

// Unknown values read as the default type; validation reports them.
pub fn service_type(svc: &Service) -> ServiceType {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .and_then(|t| t.parse().ok())
        .unwrap_or_default()
}

pub fn ip_family_policy(svc: &Service) -> Option<IpFamilyPolicy> {
    svc.spec
        .as_ref()
        .and_then(|s| s.ip_family_policy.as_deref())
        .and_then(|p| p.parse().ok())
}

pub fn external_traffic_policy(svc: &Service) -> Option<ExternalTrafficPolicy> {
    svc.spec
        .as_ref()
        .and_then(|s| s.external_traffic_policy.as_deref())
        .and_then(|p| p.parse().ok())
}

/// Families as declared, skipping entries that do not parse.
pub fn ip_families(svc: &Service) -> Vec<IpFamily> {
    raw_ip_families(svc)
        .iter()
        .filter_map(|f| f.parse().ok())
        .collect()
}

pub fn raw_ip_families(svc: &Service) -> &[String] {
    svc.spec
        .as_ref()
        .and_then(|s| s.ip_families.as_deref())
        .unwrap_or(&[])
}

pub fn cluster_ip(svc: &Service) -> &str {
    svc.spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .unwrap_or("")
}

pub fn cluster_ips(svc: &Service) -> &[String] {
    svc.spec
        .as_ref()
        .and_then(|s| s.cluster_ips.as_deref())
        .unwrap_or(&[])
}

pub fn ports(svc: &Service) -> &[ServicePort] {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or(&[])
}

pub fn health_check_node_port(svc: &Service) -> i32 {
    svc.spec
        .as_ref()
        .and_then(|s| s.health_check_node_port)
        .unwrap_or(0)
}

pub fn has_selector(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .map(|s| !s.is_empty())
        .unwrap_or(false)
}

pub fn protocol(port: &ServicePort) -> &str {
    port.protocol.as_deref().unwrap_or(PROTOCOL_TCP)
}

/// Writes both the plural field and its singular mirror.
pub fn set_cluster_ips(svc: &mut Service, ips: Vec<String>) {
    let spec = spec_mut(svc);
    spec.cluster_ip = ips.first().cloned();
    spec.cluster_ips = if ips.is_empty() { None } else { Some(ips) };
}

pub fn set_ip_families(svc: &mut Service, families: &[IpFamily]) {
    spec_mut(svc).ip_families = if families.is_empty() {
        None
    } else {
        Some(families.iter().map(|f| f.to_string()).collect())
    };
}

pub fn set_ip_family_policy(svc: &mut Service, policy: Option<IpFamilyPolicy>) {
    spec_mut(svc).ip_family_policy = policy.map(|p| p.to_string());
}

pub fn is_headless(svc: &Service) -> bool {
    cluster_ip(svc) == CLUSTER_IP_NONE
        || cluster_ips(svc).first().map(String::as_str) == Some(CLUSTER_IP_NONE)
}

/// Every type but ExternalName carries a value in clusterIP, "None" included.
pub fn needs_cluster_ip(svc: &Service) -> bool {
    service_type(svc) != ServiceType::ExternalName
}

pub fn needs_node_port(svc: &Service) -> bool {
    matches!(
        service_type(svc),
        ServiceType::NodePort | ServiceType::LoadBalancer
    )
}

/// Whether ports without an explicit node port get one allocated.
pub fn should_allocate_node_ports(svc: &Service) -> bool {
    match service_type(svc) {
        ServiceType::NodePort => true,
        ServiceType::LoadBalancer => svc
            .spec
            .as_ref()
            .and_then(|s| s.allocate_load_balancer_node_ports)
            .unwrap_or(true),
        _ => false,
    }
}

pub fn needs_health_check(svc: &Service) -> bool {
    service_type(svc) == ServiceType::LoadBalancer
        && external_traffic_policy(svc) == Some(ExternalTrafficPolicy::Local)
}

pub fn needs_external_traffic_policy(svc: &Service) -> bool {
    needs_node_port(svc)
}

/// Distinct non-zero node ports of the service ports. The health check port is not included.
pub fn collect_node_ports(svc: &Service) -> Vec<i32> {
    let mut seen = BTreeSet::new();
    ports(svc)
        .iter()
        .filter_map(|p| p.node_port)
        .filter(|np| *np != 0 && seen.insert(*np))
        .collect()
}

pub fn set_defaults(svc: &mut Service) {
    if svc.metadata.namespace.as_deref().unwrap_or("").is_empty() {
        svc.metadata.namespace = Some(DEFAULT_NAMESPACE.to_string());
    }
    let spec = spec_mut(svc);
    if spec.type_.as_deref().unwrap_or("").is_empty() {
        spec.type_ = Some(ServiceType::ClusterIP.to_string());
    }
    if let Some(ports) = spec.ports.as_mut() {
        for p in ports.iter_mut() {
            if p.protocol.as_deref().unwrap_or("").is_empty() {
                p.protocol = Some(PROTOCOL_TCP.to_string());
            }
        }
    }
    let svc_type = spec.type_.as_deref().and_then(|t| t.parse().ok());
    if matches!(
        svc_type,
        Some(ServiceType::NodePort) | Some(ServiceType::LoadBalancer)
    ) && spec.external_traffic_policy.as_deref().unwrap_or("").is_empty()
    {
        spec.external_traffic_policy = Some(ExternalTrafficPolicy::Cluster.to_string());
    }
    if svc_type == Some(ServiceType::LoadBalancer) && spec.allocate_load_balancer_node_ports.is_none()
    {
        spec.allocate_load_balancer_node_ports = Some(true);
    }
    if spec.cluster_ip.as_deref() == Some("") {
        spec.cluster_ip = None;
    }
    if spec.cluster_ips.as_ref().map(|ips| ips.is_empty()).unwrap_or(false) {
        spec.cluster_ips = None;
    }
    if spec.ip_families.as_ref().map(|f| f.is_empty()).unwrap_or(false) {
        spec.ip_families = None;
    }
    if spec.ip_family_policy.as_deref() == Some("") {
        spec.ip_family_policy = None;
    }
    if spec.external_traffic_policy.as_deref() == Some("") {
        spec.external_traffic_policy = None;
    }
    if spec.health_check_node_port == Some(0) {
        spec.health_check_node_port = None;
    }
}
