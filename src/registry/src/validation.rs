use std::collections::HashSet;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use crate::{
    error::{ErrorList, FieldError},
    service::{
        cluster_ip, cluster_ips, external_traffic_policy, health_check_node_port, ip_family_policy,
        is_headless, needs_health_check, needs_node_port, ports, protocol, raw_ip_families,
        service_type, ExternalTrafficPolicy, IpFamily, IpFamilyPolicy, ServiceType,
        CLUSTER_IP_NONE, SUPPORTED_PROTOCOLS,
    },
};

const MAX_PORT: i32 = 65535;

/// Validates a defaulted and normalized Service on its own.
pub fn validate_service(svc: &Service) -> ErrorList {
    let mut errors = ErrorList::new();

    if svc.name_any().is_empty() {
        errors.push(FieldError::required("metadata.name", "name is required"));
    }
    let Some(spec) = svc.spec.as_ref() else {
        errors.push(FieldError::required("spec", ""));
        return errors;
    };

    let raw_type = spec.type_.as_deref().unwrap_or("");
    if raw_type.parse::<ServiceType>().is_err() {
        errors.push(FieldError::not_supported(
            "spec.type",
            raw_type,
            &ServiceType::SUPPORTED,
        ));
    }
    let svc_type = service_type(svc);

    if svc_type == ServiceType::ExternalName {
        errors.extend(validate_external_name(svc));
    }

    errors.extend(validate_ports(svc));

    if needs_node_port(svc) && is_headless(svc) {
        errors.push(FieldError::invalid(
            "spec.clusterIPs[0]",
            CLUSTER_IP_NONE,
            format!("may not be set to 'None' for {svc_type} services"),
        ));
    }

    errors.extend(validate_external_traffic_fields(svc));

    if let Some(allocate) = spec.allocate_load_balancer_node_ports {
        if svc_type != ServiceType::LoadBalancer {
            errors.push(FieldError::forbidden(
                "spec.allocateLoadBalancerNodePorts",
                format!("may only be used when `type` is 'LoadBalancer', got {allocate}"),
            ));
        }
    } else if svc_type == ServiceType::LoadBalancer {
        errors.push(FieldError::required("spec.allocateLoadBalancerNodePorts", ""));
    }

    errors.extend(validate_cluster_ips_related_fields(svc));
    errors
}

/// Validates an update against the stored object.
pub fn validate_service_update(svc: &Service, old: &Service) -> ErrorList {
    let mut errors = validate_service(svc);
    if needs_health_check(old)
        && needs_health_check(svc)
        && health_check_node_port(svc) != health_check_node_port(old)
    {
        errors.push(FieldError::forbidden(
            "spec.healthCheckNodePort",
            "field is immutable",
        ));
    }
    errors
}

fn validate_external_name(svc: &Service) -> ErrorList {
    let mut errors = ErrorList::new();
    let spec = svc.spec.as_ref();
    if spec
        .and_then(|s| s.external_name.as_deref())
        .unwrap_or("")
        .is_empty()
    {
        errors.push(FieldError::required("spec.externalName", ""));
    }
    if !cluster_ip(svc).is_empty() {
        errors.push(FieldError::forbidden(
            "spec.clusterIP",
            "may not be set for ExternalName services",
        ));
    }
    if !cluster_ips(svc).is_empty() {
        errors.push(FieldError::forbidden(
            "spec.clusterIPs",
            "may not be set for ExternalName services",
        ));
    }
    if !raw_ip_families(svc).is_empty() {
        errors.push(FieldError::forbidden(
            "spec.ipFamilies",
            "may not be set for ExternalName services",
        ));
    }
    if spec.and_then(|s| s.ip_family_policy.as_ref()).is_some() {
        errors.push(FieldError::forbidden(
            "spec.ipFamilyPolicy",
            "may not be set for ExternalName services",
        ));
    }
    if spec.and_then(|s| s.health_check_node_port).unwrap_or(0) != 0 {
        errors.push(FieldError::forbidden(
            "spec.healthCheckNodePort",
            "may not be set for ExternalName services",
        ));
    }
    errors
}

fn validate_ports(svc: &Service) -> ErrorList {
    let mut errors = ErrorList::new();
    let svc_type = service_type(svc);
    let ports = ports(svc);

    if ports.is_empty() && svc_type != ServiceType::ExternalName && !is_headless(svc) {
        errors.push(FieldError::required("spec.ports", ""));
    }

    let require_name = ports.len() > 1;
    let mut names = HashSet::new();
    let mut port_keys = HashSet::new();
    let mut node_port_keys = HashSet::new();

    for (i, p) in ports.iter().enumerate() {
        let path = format!("spec.ports[{i}]");
        let name = p.name.as_deref().unwrap_or("");
        if name.is_empty() {
            if require_name {
                errors.push(FieldError::required(format!("{path}.name"), ""));
            }
        } else if !names.insert(name) {
            errors.push(FieldError::duplicate(format!("{path}.name"), name));
        }

        if p.port < 1 || p.port > MAX_PORT {
            errors.push(FieldError::invalid(
                format!("{path}.port"),
                p.port,
                "must be between 1 and 65535, inclusive",
            ));
        }

        let proto = protocol(p);
        if !SUPPORTED_PROTOCOLS.contains(&proto) {
            errors.push(FieldError::not_supported(
                format!("{path}.protocol"),
                proto,
                &SUPPORTED_PROTOCOLS,
            ));
        }

        if !port_keys.insert((proto, p.port)) {
            errors.push(FieldError::duplicate(path.clone(), format!("{}/{}", p.port, proto)));
        }

        let node_port = p.node_port.unwrap_or(0);
        if node_port == 0 {
            continue;
        }
        if !(1..=MAX_PORT).contains(&node_port) {
            errors.push(FieldError::invalid(
                format!("{path}.nodePort"),
                node_port,
                "must be between 1 and 65535, inclusive",
            ));
        }
        if !needs_node_port(svc) {
            errors.push(FieldError::forbidden(
                format!("{path}.nodePort"),
                format!("may not be used when `type` is '{svc_type}'"),
            ));
        }
        // two ports may share a node port only when their protocols differ
        if !node_port_keys.insert((proto, node_port)) {
            errors.push(FieldError::duplicate(format!("{path}.nodePort"), node_port));
        }
    }
    errors
}

fn validate_external_traffic_fields(svc: &Service) -> ErrorList {
    let mut errors = ErrorList::new();
    let svc_type = service_type(svc);
    let spec = svc.spec.as_ref();

    if let Some(raw) = spec.and_then(|s| s.external_traffic_policy.as_deref()) {
        match external_traffic_policy(svc) {
            None => errors.push(FieldError::not_supported(
                "spec.externalTrafficPolicy",
                raw,
                &ExternalTrafficPolicy::SUPPORTED,
            )),
            Some(_) if !needs_node_port(svc) => errors.push(FieldError::invalid(
                "spec.externalTrafficPolicy",
                raw,
                "may only be set when `type` is 'NodePort' or 'LoadBalancer'",
            )),
            Some(ExternalTrafficPolicy::Local) if svc_type != ServiceType::LoadBalancer => errors
                .push(FieldError::invalid(
                    "spec.externalTrafficPolicy",
                    raw,
                    "may only be 'Local' when `type` is 'LoadBalancer'",
                )),
            Some(_) => {}
        }
    }

    let hc = health_check_node_port(svc);
    if hc < 0 || hc > MAX_PORT {
        errors.push(FieldError::invalid(
            "spec.healthCheckNodePort",
            hc,
            "must be between 1 and 65535, inclusive",
        ));
    } else if hc != 0 && !needs_health_check(svc) && svc_type != ServiceType::ExternalName {
        errors.push(FieldError::invalid(
            "spec.healthCheckNodePort",
            hc,
            "may only be set when `type` is 'LoadBalancer' and `externalTrafficPolicy` is 'Local'",
        ));
    }
    errors
}

/// Loose checks on clusterIP, clusterIPs, ipFamilies and ipFamilyPolicy.
///
/// Runs before family resolution, so missing values are fine; only values
/// that contradict each other are reported.
pub fn validate_cluster_ips_related_fields(svc: &Service) -> ErrorList {
    let mut errors = ErrorList::new();
    if service_type(svc) == ServiceType::ExternalName {
        return errors;
    }

    let cluster_ip = cluster_ip(svc);
    let cluster_ips = cluster_ips(svc);
    let families = raw_ip_families(svc);

    if !cluster_ip.is_empty() {
        if cluster_ips.first().map(String::as_str) != Some(cluster_ip) {
            errors.push(FieldError::invalid(
                "spec.clusterIPs",
                cluster_ips,
                "first value must match `clusterIP`",
            ));
        }
    } else if !cluster_ips.is_empty() {
        errors.push(FieldError::invalid(
            "spec.clusterIPs",
            cluster_ips,
            "must be empty when `clusterIP` is not specified",
        ));
    }

    let mut seen = HashSet::new();
    for (i, family) in families.iter().enumerate() {
        if family.parse::<IpFamily>().is_err() {
            errors.push(FieldError::not_supported(
                format!("spec.ipFamilies[{i}]"),
                family,
                &IpFamily::SUPPORTED,
            ));
        }
        if !seen.insert(family) {
            errors.push(FieldError::duplicate(format!("spec.ipFamilies[{i}]"), family));
        }
    }
    if families.len() > 2 {
        errors.push(FieldError::invalid(
            "spec.ipFamilies",
            families,
            "may specify no more than 2 values",
        ));
    }

    if let Some(raw) = svc.spec.as_ref().and_then(|s| s.ip_family_policy.as_deref()) {
        if raw.parse::<IpFamilyPolicy>().is_err() {
            errors.push(FieldError::not_supported(
                "spec.ipFamilyPolicy",
                raw,
                &IpFamilyPolicy::SUPPORTED,
            ));
        }
    }

    let mut has_invalid_ips = false;
    for (i, ip) in cluster_ips.iter().enumerate() {
        if i == 0 && ip == CLUSTER_IP_NONE {
            if cluster_ips.len() > 1 {
                has_invalid_ips = true;
                errors.push(FieldError::invalid(
                    "spec.clusterIPs",
                    cluster_ips,
                    "'None' must be the first and only value",
                ));
            }
            continue;
        }
        if IpFamily::of_str(ip).is_none() {
            has_invalid_ips = true;
            errors.push(FieldError::invalid(
                format!("spec.clusterIPs[{i}]"),
                ip,
                "must be a valid IP address, (e.g. 10.9.8.7 or 2001:db8::ffff)",
            ));
        }
    }
    if cluster_ips.len() > 2 {
        errors.push(FieldError::invalid(
            "spec.clusterIPs",
            cluster_ips,
            "may only hold up to 2 values",
        ));
    }
    // family checks on malformed addresses only add noise
    if has_invalid_ips {
        return errors;
    }

    if cluster_ips.len() > 1 {
        let distinct = cluster_ips
            .iter()
            .filter_map(|ip| IpFamily::of_str(ip))
            .collect::<HashSet<IpFamily>>();
        if distinct.len() != cluster_ips.len() {
            errors.push(FieldError::invalid(
                "spec.clusterIPs",
                cluster_ips,
                "may specify no more than one IP for each IP family",
            ));
        }
    }

    if !is_headless(svc) {
        for (i, (ip, family)) in cluster_ips.iter().zip(families.iter()).enumerate() {
            let expected = match family.parse::<IpFamily>() {
                Ok(f) => f,
                Err(_) => continue,
            };
            if IpFamily::of_str(ip) != Some(expected) {
                errors.push(FieldError::invalid(
                    format!("spec.clusterIPs[{i}]"),
                    ip,
                    format!("expected an {expected} value as indicated by `ipFamilies[{i}]`"),
                ));
            }
        }
    }
    errors
}

/// Checks the transition of resolved clusterIPs and ipFamilies.
///
/// The primary value of each is immutable. A secondary value may be added,
/// and may only be removed with the SingleStack policy.
pub fn validate_upgrade_downgrade(svc: &Service, old: &Service) -> ErrorList {
    let mut errors = validate_upgrade_downgrade_cluster_ips(svc, old);
    errors.extend(validate_upgrade_downgrade_ip_families(svc, old));
    errors
}

fn validate_upgrade_downgrade_cluster_ips(svc: &Service, old: &Service) -> ErrorList {
    let mut errors = ErrorList::new();
    if service_type(svc) == ServiceType::ExternalName
        || service_type(old) == ServiceType::ExternalName
    {
        return errors;
    }
    if is_headless(svc) && is_headless(old) {
        return errors;
    }

    let new_ips = cluster_ips(svc);
    let old_ips = cluster_ips(old);
    let single_stack = ip_family_policy(svc) == Some(IpFamilyPolicy::SingleStack);

    if old_ips.len() == new_ips.len() {
        for (i, (old_ip, new_ip)) in old_ips.iter().zip(new_ips.iter()).enumerate() {
            if old_ip != new_ip {
                errors.push(FieldError::invalid(
                    format!("spec.clusterIPs[{i}]"),
                    new_ips,
                    "may not change once set",
                ));
            }
        }
    } else if old_ips.len() > new_ips.len() {
        match new_ips.first() {
            None => errors.push(FieldError::invalid(
                "spec.clusterIPs[0]",
                new_ips,
                "primary clusterIP can not be unset",
            )),
            Some(primary) if Some(primary) != old_ips.first() => {
                errors.push(FieldError::invalid(
                    "spec.clusterIPs[0]",
                    new_ips,
                    "may not change once set",
                ))
            }
            Some(_) => {}
        }
        if new_ips.len() == 1 && !single_stack {
            errors.push(FieldError::invalid(
                "spec.clusterIPs[0]",
                new_ips,
                "`ipFamilyPolicy` must be set to 'SingleStack' when releasing the secondary clusterIP",
            ));
        }
    } else if let (Some(old_primary), Some(new_primary)) = (old_ips.first(), new_ips.first()) {
        if old_primary != new_primary {
            errors.push(FieldError::invalid(
                "spec.clusterIPs[0]",
                new_ips,
                "may not change once set",
            ));
        }
    }
    errors
}

fn validate_upgrade_downgrade_ip_families(svc: &Service, old: &Service) -> ErrorList {
    let mut errors = ErrorList::new();
    if service_type(svc) == ServiceType::ExternalName
        || service_type(old) == ServiceType::ExternalName
    {
        return errors;
    }
    // headless services may change families
    if is_headless(svc) || is_headless(old) {
        return errors;
    }

    let new_families = raw_ip_families(svc);
    let old_families = raw_ip_families(old);
    let single_stack = ip_family_policy(svc) == Some(IpFamilyPolicy::SingleStack);

    if old_families.len() == new_families.len() {
        if old_families != new_families {
            errors.push(FieldError::invalid(
                "spec.ipFamilies[0]",
                new_families,
                "may not change once set",
            ));
        }
    } else if old_families.len() > new_families.len() {
        match new_families.first() {
            None => errors.push(FieldError::invalid(
                "spec.ipFamilies[0]",
                new_families,
                "primary ipFamily can not be unset",
            )),
            Some(primary) if Some(primary) != old_families.first() => {
                errors.push(FieldError::invalid(
                    "spec.ipFamilies[0]",
                    new_families,
                    "may not change once set",
                ))
            }
            Some(_) => {}
        }
        if new_families.len() == 1 && !single_stack {
            errors.push(FieldError::invalid(
                "spec.ipFamilies[0]",
                new_families,
                "`ipFamilyPolicy` must be set to 'SingleStack' when releasing the secondary ipFamily",
            ));
        }
    } else if let (Some(old_primary), Some(new_primary)) =
        (old_families.first(), new_families.first())
    {
        if old_primary != new_primary {
            errors.push(FieldError::invalid(
                "spec.ipFamilies[0]",
                new_families,
                "may not change once set",
            ));
        }
    }
    errors
}
