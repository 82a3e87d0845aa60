//! Damaged and partial stores.

use ctrmeta_rs::fixture::{encode_spec, truncate_bucket_header, BoltWriter, Tree};
use ctrmeta_rs::{ErrorKind, Outcome};

use crate::fixture::{sample_metadata, TestHost, PAGE_SIZE};
use crate::integration_test;

const META_CHECKSUM_OFFSET: usize = 16 + 56;

integration_test!(test_garbage_store_is_corrupt, || {
    let host = TestHost::new()?;
    host.write_raw(&host.metadata_path(), &[0x42; 3 * PAGE_SIZE])?;
    let err = ctrmeta_rs::Explorer::open(host.config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    Ok(())
});

integration_test!(test_store_without_version_bucket_is_corrupt, || {
    let host = TestHost::new()?;
    let mut tree = Tree::new();
    tree.path(&["v2", "default"]);
    host.write_metadata(&tree)?;
    let err = ctrmeta_rs::Explorer::open(host.config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    Ok(())
});

integration_test!(test_meta_page_fallback, || {
    let host = TestHost::new()?;
    let mut data = BoltWriter::new().write(&sample_metadata());

    // Newest meta (txid 1) damaged: the older one is used.
    data[PAGE_SIZE + META_CHECKSUM_OFFSET] ^= 0xff;
    host.write_raw(&host.metadata_path(), &data)?;
    let explorer = host.explorer()?;
    assert_eq!(explorer.store().db().txid(), 0);
    assert_eq!(explorer.list_containers()?.records.len(), 3);

    // Both damaged: unusable.
    data[META_CHECKSUM_OFFSET] ^= 0xff;
    host.write_raw(&host.metadata_path(), &data)?;
    let err = ctrmeta_rs::Explorer::open(host.config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    Ok(())
});

integration_test!(test_damaged_namespace_is_skipped, || {
    let host = TestHost::new()?;
    host.write_broken_namespace()?;

    let scan = host.explorer()?.list_containers()?;
    let failed: Vec<_> = scan.failed_namespaces().map(|(ns, _)| ns).collect();
    assert_eq!(failed, vec!["broken"]);
    assert_eq!(scan.records.len(), 3);
    assert!(scan
        .namespaces
        .iter()
        .any(|n| n.namespace == "k8s.io" && n.outcome == Outcome::Records(2)));
    Ok(())
});

integration_test!(test_malformed_record_header_keeps_siblings, || {
    let host = TestHost::new()?;
    let mut tree = Tree::new();
    let containers = tree.path(&["v1", "default", "containers"]);
    for id in ["aaa", "bbb", "ccc"] {
        containers.bucket(id).put("image", "app:1");
    }
    let mut data = BoltWriter::new().inline_buckets(false).write(&tree);
    assert!(truncate_bucket_header(&mut data, PAGE_SIZE, b"bbb"));
    host.write_raw(&host.metadata_path(), &data)?;

    let scan = host.explorer()?.list_containers()?;
    let ids: Vec<_> = scan.records.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["aaa", "ccc"]);
    assert_eq!(scan.failed_namespaces().count(), 0);
    assert!(scan
        .namespaces
        .iter()
        .any(|n| n.namespace == "default" && n.outcome == Outcome::Records(2)));
    Ok(())
});

integration_test!(test_malformed_fields_do_not_abort, || {
    let host = TestHost::new()?;
    let mut tree = Tree::new();
    let containers = tree.path(&["v1", "default", "containers"]);
    containers
        .bucket("bad-spec")
        .put("image", "app:1")
        .put("createdat", vec![7u8, 0, 0])
        .put("spec", encode_spec("{\"hostname\": 42}"));
    containers
        .bucket("good")
        .put("image", "app:1")
        .put("spec", encode_spec(r#"{"hostname": "ok"}"#));
    host.write_metadata(&tree)?;

    let scan = host.explorer()?.list_containers()?;
    assert_eq!(scan.records.len(), 2);
    assert_eq!(scan.records[0].hostname, "");
    assert_eq!(scan.records[0].created_at, None);
    assert_eq!(scan.records[1].hostname, "ok");
    Ok(())
});

integration_test!(test_large_store_with_branch_pages, || {
    let host = TestHost::new()?;
    let mut tree = Tree::new();
    let containers = tree.path(&["v1", "default", "containers"]);
    for i in 0..300 {
        containers
            .bucket(format!("c-{i:04}"))
            .put("image", "app:1");
    }
    let data = BoltWriter::new().max_leaf_entries(8).write(&tree);
    host.write_raw(&host.metadata_path(), &data)?;

    let scan = host.explorer()?.list_containers()?;
    assert_eq!(scan.records.len(), 300);
    assert_eq!(scan.records[0].id, "c-0000");
    assert_eq!(scan.records[299].id, "c-0299");
    Ok(())
});
