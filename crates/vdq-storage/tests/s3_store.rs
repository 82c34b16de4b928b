//! S3 integration tests.

use std::io::Write;
use std::time::Duration;

use vdq_storage::{ArtifactStore, S3Store};

/// Upload, list, presign and delete one object.
#[tokio::test]
#[ignore = "requires S3 credentials"]
async fn test_object_lifecycle() {
    dotenvy::dotenv().ok();

    let store = S3Store::from_env().await.expect("Failed to create client");
    store
        .check_connectivity()
        .await
        .expect("Bucket not reachable");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[7u8; 4096]).unwrap();

    let key = "vdq-integration-test.mp4";
    store
        .put(key, file.path(), Some("vidf_integration.mp4"))
        .await
        .expect("Failed to upload");

    let listed = store.list(key).await.expect("Failed to list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].size, 4096);

    let url = store
        .presign(key, Duration::from_secs(60))
        .await
        .expect("Failed to presign");
    assert!(url.contains(key));

    store.delete(key).await.expect("Failed to delete");
    assert!(store.list(key).await.unwrap().is_empty());
}
