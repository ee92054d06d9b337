// Builders shared by unit and integration tests.
use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::core::ObjectMeta;
use svcalloc_ipam::port::DEFAULT_NODE_PORT_RANGE;

use crate::{
    alloc::Allocators,
    config::{Config, FeatureGate},
    metrics::Metrics,
    rest::REST,
    service::{set_cluster_ips, spec_mut, ServiceType, DEFAULT_NAMESPACE},
    storage::MemoryStore,
};

pub type Tweak = Box<dyn Fn(&mut Service)>;

/// A ClusterIP service with a selector and a single TCP port 80 named "p".
pub fn make_service(name: &str, tweaks: Vec<Tweak>) -> Service {
    let mut svc = Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(ServiceType::ClusterIP.to_string()),
            selector: Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
            ports: Some(vec![make_service_port("p", 80, "TCP", 0)]),
            ..Default::default()
        }),
        status: None,
    };
    for tweak in tweaks.iter() {
        tweak(&mut svc);
    }
    svc
}

pub fn make_service_port(name: &str, port: i32, protocol: &str, node_port: i32) -> ServicePort {
    ServicePort {
        name: (!name.is_empty()).then(|| name.to_string()),
        port,
        protocol: (!protocol.is_empty()).then(|| protocol.to_string()),
        node_port: (node_port != 0).then_some(node_port),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

pub fn set_type(t: ServiceType) -> Tweak {
    Box::new(move |svc: &mut Service| {
        spec_mut(svc).type_ = Some(t.to_string());
        if t == ServiceType::LoadBalancer {
            spec_mut(svc).allocate_load_balancer_node_ports = Some(true);
        }
        if matches!(t, ServiceType::NodePort | ServiceType::LoadBalancer) {
            spec_mut(svc).external_traffic_policy = Some("Cluster".to_string());
        }
    })
}

pub fn set_type_cluster_ip() -> Tweak {
    set_type(ServiceType::ClusterIP)
}

pub fn set_type_node_port() -> Tweak {
    set_type(ServiceType::NodePort)
}

pub fn set_type_load_balancer() -> Tweak {
    set_type(ServiceType::LoadBalancer)
}

pub fn set_type_external_name() -> Tweak {
    Box::new(|svc: &mut Service| {
        let spec = spec_mut(svc);
        spec.type_ = Some(ServiceType::ExternalName.to_string());
        spec.external_name = Some("foo.example.com".to_string());
        spec.selector = None;
        if let Some(ports) = spec.ports.as_mut() {
            for p in ports.iter_mut() {
                p.node_port = None;
            }
        }
    })
}

pub fn set_cluster_ip_list(ips: &[&str]) -> Tweak {
    let ips = ips.iter().map(|ip| ip.to_string()).collect::<Vec<String>>();
    Box::new(move |svc: &mut Service| set_cluster_ips(svc, ips.clone()))
}

pub fn set_headless() -> Tweak {
    set_cluster_ip_list(&["None"])
}

pub fn set_selector(selector: &[(&str, &str)]) -> Tweak {
    let selector = selector
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<BTreeMap<String, String>>();
    Box::new(move |svc: &mut Service| {
        spec_mut(svc).selector = (!selector.is_empty()).then(|| selector.clone());
    })
}

pub fn set_ip_families(families: &[&str]) -> Tweak {
    let families = families.iter().map(|f| f.to_string()).collect::<Vec<String>>();
    Box::new(move |svc: &mut Service| {
        spec_mut(svc).ip_families = (!families.is_empty()).then(|| families.clone());
    })
}

pub fn set_ip_family_policy(policy: &str) -> Tweak {
    let policy = policy.to_string();
    Box::new(move |svc: &mut Service| {
        spec_mut(svc).ip_family_policy = (!policy.is_empty()).then(|| policy.clone());
    })
}

pub fn set_ports(ports: Vec<ServicePort>) -> Tweak {
    Box::new(move |svc: &mut Service| spec_mut(svc).ports = Some(ports.clone()))
}

/// Sets node ports by index, zero clears the value.
pub fn set_node_ports(node_ports: &[i32]) -> Tweak {
    let node_ports = node_ports.to_vec();
    Box::new(move |svc: &mut Service| {
        if let Some(ports) = spec_mut(svc).ports.as_mut() {
            for (p, np) in ports.iter_mut().zip(node_ports.iter()) {
                p.node_port = (*np != 0).then_some(*np);
            }
        }
    })
}

pub fn set_external_traffic_policy(policy: &str) -> Tweak {
    let policy = policy.to_string();
    Box::new(move |svc: &mut Service| {
        spec_mut(svc).external_traffic_policy = (!policy.is_empty()).then(|| policy.clone());
    })
}

pub fn set_health_check_node_port(port: i32) -> Tweak {
    Box::new(move |svc: &mut Service| {
        spec_mut(svc).health_check_node_port = (port != 0).then_some(port);
    })
}

pub fn set_allocate_lb_node_ports(allocate: bool) -> Tweak {
    Box::new(move |svc: &mut Service| spec_mut(svc).allocate_load_balancer_node_ports = Some(allocate))
}

pub fn set_finalizers(finalizers: &[&str]) -> Tweak {
    let finalizers = finalizers.iter().map(|f| f.to_string()).collect::<Vec<String>>();
    Box::new(move |svc: &mut Service| {
        svc.metadata.finalizers = (!finalizers.is_empty()).then(|| finalizers.clone());
    })
}

pub fn test_config(ranges: &[&str], node_port_range: &str, dual_stack: bool) -> Config {
    Config {
        service_cluster_ip_ranges: ranges.iter().map(|r| r.to_string()).collect(),
        service_node_port_range: node_port_range.to_string(),
        dual_stack,
    }
}

pub fn test_allocators(ranges: &[&str]) -> Allocators {
    Allocators::new(&test_config(ranges, DEFAULT_NODE_PORT_RANGE, true))
        .expect("valid allocator config")
}

pub fn test_rest(ranges: &[&str], dual_stack: bool) -> REST<MemoryStore> {
    test_rest_with_node_ports(ranges, DEFAULT_NODE_PORT_RANGE, dual_stack)
}

pub fn test_rest_with_node_ports(
    ranges: &[&str],
    node_port_range: &str,
    dual_stack: bool,
) -> REST<MemoryStore> {
    let config = test_config(ranges, node_port_range, dual_stack);
    let allocators = Allocators::new(&config).expect("valid allocator config");
    REST::new(
        MemoryStore::default(),
        Arc::new(allocators),
        Arc::new(FeatureGate::from(&config)),
        Metrics::new().expect("metrics"),
    )
}

pub fn test_trace() {
    let _ = svcalloc_trace::init::prepare_tracing(svcalloc_trace::init::TraceConfig {
        level: "info".to_string(),
        format: String::new(),
        file: None,
    });
}
