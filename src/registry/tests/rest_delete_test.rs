use svcalloc_ipam::Allocator;
use svcalloc_registry::{
    fixture::*,
    service::{cluster_ips, collect_node_ports, health_check_node_port},
    storage::{CreateOptions, DeleteOptions, Preconditions, UpdateOptions},
};

use crate::common::{usage, DUAL_STACK};

mod common;

#[tokio::test]
async fn integration_test_delete_releases_allocations() {
    test_trace();
    let rest = test_rest(&DUAL_STACK, true);

    dbg!("Creating Services of every type");
    for svc in [
        make_service("cluster-ip", vec![set_ip_family_policy("RequireDualStack")]),
        make_service("node-port", vec![set_type_node_port()]),
        make_service(
            "lb",
            vec![set_type_load_balancer(), set_external_traffic_policy("Local")],
        ),
        make_service("headless", vec![set_headless()]),
        make_service("external", vec![set_type_external_name()]),
    ] {
        rest.create(svc, &CreateOptions::default()).await.unwrap();
    }
    assert_eq!(usage(rest.allocators()), (3, 1, 3));

    dbg!("Deleting all of them");
    for name in ["cluster-ip", "node-port", "lb", "headless", "external"] {
        let (_, deleted) = rest
            .delete("default", name, &DeleteOptions::default())
            .await
            .unwrap();
        assert!(deleted);
    }
    assert_eq!(usage(rest.allocators()), (0, 0, 0));
    assert!(rest.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn integration_test_delete_then_reuse() {
    test_trace();
    let rest = test_rest(&DUAL_STACK, true);
    let svc = make_service(
        "a",
        vec![
            set_type_node_port(),
            set_node_ports(&[30080]),
            set_cluster_ip_list(&["10.0.0.10"]),
        ],
    );

    rest.create(svc.clone(), &CreateOptions::default())
        .await
        .unwrap();

    dbg!("Requesting the same values under another name fails");
    let mut other = svc.clone();
    other.metadata.name = Some("b".to_string());
    assert!(rest
        .create(other.clone(), &CreateOptions::default())
        .await
        .is_err());

    dbg!("Deleting the owner frees them");
    rest.delete("default", "a", &DeleteOptions::default())
        .await
        .unwrap();
    let created = rest
        .create(other, &CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(cluster_ips(&created), &["10.0.0.10".to_string()]);
    assert_eq!(collect_node_ports(&created), vec![30080]);
}

#[tokio::test]
async fn integration_test_delete_with_finalizers() {
    test_trace();
    let rest = test_rest(&DUAL_STACK, true);

    let created = rest
        .create(
            make_service(
                "lb",
                vec![
                    set_type_load_balancer(),
                    set_external_traffic_policy("Local"),
                    set_finalizers(&["service.kubernetes.io/load-balancer-cleanup"]),
                ],
            ),
            &CreateOptions::default(),
        )
        .await
        .unwrap();
    let hc = health_check_node_port(&created);

    dbg!("Deleting marks the Service but keeps its allocations");
    let (marked, deleted) = rest
        .delete("default", "lb", &DeleteOptions::default())
        .await
        .unwrap();
    assert!(!deleted);
    assert!(marked.metadata.deletion_timestamp.is_some());
    assert_eq!(usage(rest.allocators()), (1, 0, 2));

    dbg!("Removing the finalizer");
    let mut svc = rest.get("default", "lb").await.unwrap();
    svc.metadata.finalizers = None;
    let (updated, _) = rest
        .update(svc, false, &UpdateOptions::default())
        .await
        .unwrap();
    assert!(updated.metadata.deletion_timestamp.is_some());
    assert!(rest.allocators().node_port_allocator().has(hc));

    dbg!("Deleting again removes the Service and releases everything");
    let (_, deleted) = rest
        .delete("default", "lb", &DeleteOptions::default())
        .await
        .unwrap();
    assert!(deleted);
    assert_eq!(usage(rest.allocators()), (0, 0, 0));
    assert!(rest.get("default", "lb").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn integration_test_delete_dry_run() {
    test_trace();
    let rest = test_rest(&DUAL_STACK, true);

    rest.create(
        make_service("a", vec![set_type_node_port()]),
        &CreateOptions::default(),
    )
    .await
    .unwrap();

    let (svc, deleted) = rest
        .delete("default", "a", &DeleteOptions::dry_run())
        .await
        .unwrap();
    assert!(deleted);
    assert_eq!(svc.metadata.name.as_deref(), Some("a"));
    assert_eq!(usage(rest.allocators()), (1, 0, 1));
    assert!(rest.get("default", "a").await.is_ok());
}

#[tokio::test]
async fn integration_test_delete_preconditions() {
    test_trace();
    let rest = test_rest(&DUAL_STACK, true);

    let created = rest
        .create(make_service("a", vec![]), &CreateOptions::default())
        .await
        .unwrap();

    let stale = DeleteOptions {
        preconditions: Some(Preconditions {
            uid: Some("someone-else".to_string()),
            resource_version: None,
        }),
        ..Default::default()
    };
    match rest.delete("default", "a", &stale).await {
        Ok(_) => panic!("this test should be failed"),
        Err(e) => assert!(e.is_conflict(), "{e}"),
    }
    assert_eq!(usage(rest.allocators()), (1, 0, 0));

    let matching = DeleteOptions {
        preconditions: Some(Preconditions {
            uid: created.metadata.uid.clone(),
            resource_version: created.metadata.resource_version.clone(),
        }),
        ..Default::default()
    };
    let (_, deleted) = rest.delete("default", "a", &matching).await.unwrap();
    assert!(deleted);
    assert_eq!(usage(rest.allocators()), (0, 0, 0));

    dbg!("Deleting a missing Service");
    match rest.delete("default", "a", &DeleteOptions::default()).await {
        Ok(_) => panic!("this test should be failed"),
        Err(e) => assert!(e.is_not_found(), "{e}"),
    }
}
