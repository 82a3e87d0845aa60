//! Listings over a complete sample host.

use ctrmeta_rs::{ErrorKind, Explorer, ExplorerConfig, Outcome, TaskStatus};

use crate::fixture::{sample_time, TestHost};
use crate::integration_test;

integration_test!(test_namespaces_in_key_order, || {
    let host = TestHost::sample()?;
    let explorer = host.explorer()?;
    assert_eq!(explorer.namespaces()?, vec!["default", "empty", "k8s.io"]);
    Ok(())
});

integration_test!(test_containers_decoded, || {
    let host = TestHost::sample()?;
    let scan = host.explorer()?.list_containers()?;

    let ids: Vec<_> = scan.records.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["tool", "app-1", "fluent-1"]);

    let app = &scan.records[1];
    assert_eq!(app.namespace, "k8s.io");
    assert_eq!(app.hostname, "web-7d9f");
    assert!(!app.support_container);
    assert_eq!(app.container_type, "container");
    assert_eq!(app.created_at, Some(sample_time()));
    assert_eq!(app.labels["io.kubernetes.pod.name"], "web-7d9f");
    assert_eq!(app.runtime, "io.containerd.runc.v2");

    let fluent = &scan.records[2];
    assert_eq!(fluent.hostname, "gke-node-1");
    assert!(fluent.support_container);

    let tool = &scan.records[0];
    assert_eq!(tool.hostname, "");
    assert_eq!(tool.container_type, "");

    let outcomes: Vec<_> = scan.namespaces.iter().map(|n| n.outcome.clone()).collect();
    assert_eq!(
        outcomes,
        vec![Outcome::Records(1), Outcome::Empty, Outcome::Records(2)]
    );
    Ok(())
});

integration_test!(test_images_and_content, || {
    let host = TestHost::sample()?;
    let explorer = host.explorer()?;

    let images = explorer.list_images()?;
    assert_eq!(images.records.len(), 2);
    let support: Vec<_> = images
        .records
        .iter()
        .filter(|i| i.support_image)
        .map(|i| i.name.as_str())
        .collect();
    assert_eq!(support, vec!["gke.gcr.io/fluent-bit:v1.8.12-gke.3"]);

    let content = explorer.list_content()?;
    assert_eq!(content.records.len(), 1);
    assert_eq!(content.records[0].digest, "sha256:1111");
    assert_eq!(content.records[0].size, 1024);

    let ingests = explorer.list_ingests()?;
    assert_eq!(ingests.records.len(), 1);
    assert_eq!(ingests.records[0].expected, "sha256:3333");
    Ok(())
});

integration_test!(test_leases, || {
    let host = TestHost::sample()?;
    let leases = host.explorer()?.list_leases()?;
    assert_eq!(leases.records.len(), 1);

    let lease = &leases.records[0];
    assert_eq!(lease.id(), "pull-1");
    assert_eq!(lease.namespace(), "k8s.io");
    let json = serde_json::to_value(lease)?;
    assert_eq!(json["Content"], serde_json::json!(["sha256:1111"]));
    assert_eq!(json["Snapshots"]["overlayfs"], serde_json::json!(["sha256:base"]));
    Ok(())
});

integration_test!(test_tasks_follow_containers, || {
    let host = TestHost::sample()?;
    host.write_pid("k8s.io", "fluent-1", "not a pid")?;
    let tasks = host.explorer()?.list_tasks()?;

    let status: Vec<_> = tasks
        .records
        .iter()
        .map(|t| (t.container_id.as_str(), t.pid, t.status))
        .collect();
    assert_eq!(
        status,
        vec![
            ("tool", 0, TaskStatus::Stopped),
            ("app-1", 31337, TaskStatus::Running),
            ("fluent-1", 0, TaskStatus::Unknown),
        ]
    );
    Ok(())
});

integration_test!(test_missing_store_is_not_found, || {
    let host = TestHost::new()?;
    let err = Explorer::open(ExplorerConfig::with_root(host.root())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
});

integration_test!(test_explicit_metadata_db, || {
    let host = TestHost::sample()?;
    let copy = host.state().join("evidence.db");
    std::fs::copy(host.metadata_path(), &copy)?;
    let config = ExplorerConfig {
        metadata_db: Some(copy.clone()),
        ..host.config()
    };
    let explorer = Explorer::open(config)?;
    assert_eq!(explorer.store().path(), copy.as_path());
    assert_eq!(explorer.list_containers()?.records.len(), 3);
    Ok(())
});
