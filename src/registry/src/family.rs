use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use crate::{
    error::{Error, ErrorList, FieldError},
    service::{
        cluster_ip, cluster_ips, has_selector, ip_families, ip_family_policy, service_type,
        set_cluster_ips, set_ip_families, set_ip_family_policy, IpFamily, IpFamilyPolicy,
        ServiceType, CLUSTER_IP_NONE,
    },
    validation::validate_cluster_ips_related_fields,
};

/// The family-related fields a Service ends up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub policy: Option<IpFamilyPolicy>,
    pub families: Vec<IpFamily>,
    /// Requested cluster IPs. May be shorter than `families`; the missing
    /// entries are allocated afterwards.
    pub cluster_ips: Vec<String>,
}

impl Resolution {
    fn of(svc: &Service) -> Resolution {
        Resolution {
            policy: ip_family_policy(svc),
            families: ip_families(svc),
            cluster_ips: cluster_ips(svc).to_vec(),
        }
    }
}

/// Resolves ipFamilyPolicy, ipFamilies and clusterIPs of `svc` against the
/// families configured on the cluster, primary first.
///
/// Nothing is written to `svc`; see [`init_ip_family_fields`].
pub fn resolve(
    svc: &Service,
    old: Option<&Service>,
    cluster: &[IpFamily],
    dual_stack: bool,
) -> Result<Resolution, ErrorList> {
    if service_type(svc) == ServiceType::ExternalName {
        return Ok(Resolution {
            policy: None,
            families: Vec::new(),
            cluster_ips: Vec::new(),
        });
    }

    let primary = cluster.first().copied().unwrap_or(IpFamily::IPv4);

    if !dual_stack {
        return resolve_single_stack(svc, old, primary);
    }

    if let Some(old) = old {
        if is_matching_prefer_dual_stack(old, svc) {
            return Ok(Resolution::of(svc));
        }
    }

    let mut errors = validate_cluster_ips_related_fields(svc);
    if !errors.is_empty() {
        return Err(errors);
    }

    let mut res = Resolution::of(svc);
    let raw_policy = svc
        .spec
        .as_ref()
        .and_then(|s| s.ip_family_policy.clone())
        .unwrap_or_default();

    if let Some(old) = old {
        if res.policy == Some(IpFamilyPolicy::SingleStack) {
            // the primary values are immutable, so dropping the secondary is safe
            if same_cluster_ips(old, svc) && res.cluster_ips.len() > 1 {
                res.cluster_ips.truncate(1);
            }
            if same_ip_families(old, svc) && res.families.len() > 1 {
                res.families.truncate(1);
            }
        } else {
            if reduced(cluster_ips(svc).len(), cluster_ips(old).len()) {
                errors.push(FieldError::invalid(
                    "spec.ipFamilyPolicy",
                    &raw_policy,
                    "must be 'SingleStack' to release the secondary cluster IP",
                ));
            }
            if reduced(ip_families(svc).len(), ip_families(old).len()) {
                errors.push(FieldError::invalid(
                    "spec.ipFamilyPolicy",
                    &raw_policy,
                    "must be 'SingleStack' to release the secondary IP family",
                ));
            }
        }
    }

    if res.policy == Some(IpFamilyPolicy::SingleStack) {
        if res.cluster_ips.len() == 2 {
            errors.push(FieldError::invalid(
                "spec.ipFamilyPolicy",
                &raw_policy,
                "must be 'RequireDualStack' or 'PreferDualStack' when multiple cluster IPs are specified",
            ));
        }
        if res.families.len() == 2 {
            errors.push(FieldError::invalid(
                "spec.ipFamilyPolicy",
                &raw_policy,
                "must be 'RequireDualStack' or 'PreferDualStack' when multiple IP families are specified",
            ));
        }
    }

    for (i, ip) in res.cluster_ips.clone().iter().enumerate() {
        if ip == CLUSTER_IP_NONE {
            break;
        }
        let Some(family) = IpFamily::of_str(ip) else {
            continue;
        };
        if i < res.families.len() {
            continue;
        }
        if cluster.contains(&family) {
            res.families.push(family);
        } else {
            errors.push(FieldError::invalid(
                format!("spec.clusterIPs[{i}]"),
                &res.cluster_ips,
                format!("{family} is not configured on this cluster"),
            ));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    // headless services without a selector take whatever families the
    // endpoints turn out to have, so no further checks apply
    if cluster_ip(svc) == CLUSTER_IP_NONE && !has_selector(svc) {
        if res.families.is_empty() {
            res.families.push(primary);
        }
        let policy = *res.policy.get_or_insert(IpFamilyPolicy::RequireDualStack);
        if policy != IpFamilyPolicy::SingleStack && res.families.len() == 1 {
            res.families.push(res.families[0].other());
        }
        return Ok(res);
    }

    let policy = *res.policy.get_or_insert(if res.families.len() == 2 {
        IpFamilyPolicy::RequireDualStack
    } else {
        IpFamilyPolicy::SingleStack
    });

    if policy == IpFamilyPolicy::RequireDualStack && cluster.len() < 2 {
        errors.push(FieldError::invalid(
            "spec.ipFamilyPolicy",
            policy.as_str(),
            "this cluster is not configured for dual-stack services",
        ));
    }
    for (i, family) in res.families.iter().enumerate() {
        if !cluster.contains(family) {
            errors.push(FieldError::invalid(
                format!("spec.ipFamilies[{i}]"),
                family.as_str(),
                "not configured on this cluster",
            ));
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    if res.families.is_empty() {
        res.families.push(primary);
    }
    if policy != IpFamilyPolicy::SingleStack && res.families.len() == 1 && cluster.len() == 2 {
        res.families.push(res.families[0].other());
    }
    Ok(res)
}

// Without dual-stack every new service is single-stack on the primary family.
// Services that are already dual-stack are left alone.
fn resolve_single_stack(
    svc: &Service,
    old: Option<&Service>,
    primary: IpFamily,
) -> Result<Resolution, ErrorList> {
    if let Some(old) = old {
        if service_type(old) != ServiceType::ExternalName && ip_families(old).len() == 2 {
            return Ok(Resolution {
                policy: ip_family_policy(old),
                families: ip_families(old),
                cluster_ips: cluster_ips(svc).to_vec(),
            });
        }
    }

    let mut ips = cluster_ips(svc).to_vec();
    ips.truncate(1);
    if let Some(ip) = ips.first() {
        if ip != CLUSTER_IP_NONE && IpFamily::of_str(ip) != Some(primary) {
            return Err(FieldError::invalid(
                "spec.clusterIPs[0]",
                ip,
                format!("expected an {primary} value, dual-stack is not enabled"),
            )
            .into());
        }
    }
    Ok(Resolution {
        policy: Some(IpFamilyPolicy::SingleStack),
        families: vec![primary],
        cluster_ips: ips,
    })
}

/// Resolves and writes the family-related fields. `svc` is untouched on error.
pub fn init_ip_family_fields(
    svc: &mut Service,
    old: Option<&Service>,
    cluster: &[IpFamily],
    dual_stack: bool,
) -> Result<(), Error> {
    let res = resolve(svc, old, cluster, dual_stack).map_err(|e| Error::invalid(&svc.name_any(), e))?;
    set_ip_family_policy(svc, res.policy);
    set_ip_families(svc, &res.families);
    set_cluster_ips(svc, res.cluster_ips);
    Ok(())
}

pub fn same_cluster_ips(old: &Service, svc: &Service) -> bool {
    cluster_ips(old) == cluster_ips(svc)
}

pub fn same_ip_families(old: &Service, svc: &Service) -> bool {
    ip_families(old) == ip_families(svc)
}

/// An update that keeps a PreferDualStack service exactly as it was. Such a
/// service is never upgraded or downgraded implicitly when the cluster changes.
pub fn is_matching_prefer_dual_stack(old: &Service, svc: &Service) -> bool {
    service_type(old) == service_type(svc)
        && ip_family_policy(old) == Some(IpFamilyPolicy::PreferDualStack)
        && ip_family_policy(svc) == Some(IpFamilyPolicy::PreferDualStack)
        && same_cluster_ips(old, svc)
        && same_ip_families(old, svc)
}

// An empty new list means the caller did not say anything.
fn reduced(new_len: usize, old_len: usize) -> bool {
    new_len != 0 && new_len < old_len
}
