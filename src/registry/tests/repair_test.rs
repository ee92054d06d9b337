use std::sync::Arc;

use svcalloc_registry::{
    fixture::*,
    repair::Repair,
    storage::{CreateOptions, DeleteOptions},
};

use crate::common::{usage, DUAL_STACK};

mod common;

#[tokio::test]
async fn integration_test_repair_rebuilds_pools() {
    test_trace();
    let rest = test_rest(&DUAL_STACK, true);

    dbg!("Creating Services through the registry");
    for svc in [
        make_service("a", vec![set_ip_family_policy("PreferDualStack")]),
        make_service("b", vec![set_type_node_port()]),
        make_service(
            "c",
            vec![set_type_load_balancer(), set_external_traffic_policy("Local")],
        ),
        make_service("d", vec![set_headless()]),
        make_service("e", vec![set_type_external_name()]),
    ] {
        rest.create(svc, &CreateOptions::default()).await.unwrap();
    }
    rest.delete("default", "b", &DeleteOptions::default())
        .await
        .unwrap();
    let expected = usage(rest.allocators());
    assert_eq!(expected, (2, 1, 2));

    dbg!("Rebuilding fresh pools from the store");
    let allocators = Arc::new(test_allocators(&DUAL_STACK));
    let report = Repair::new(allocators.clone())
        .run_once(rest.store())
        .await
        .unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.services, 4);
    assert_eq!(report.marked, 5);
    assert_eq!(usage(&allocators), expected);

    dbg!("Running again only finds duplicates");
    let report = Repair::new(allocators.clone())
        .run_once(rest.store())
        .await
        .unwrap();
    assert_eq!(report.marked, 0);
    assert_eq!(report.duplicates.len(), 5);
    assert_eq!(usage(&allocators), expected);
}
