//! Broker behaviour under concurrent producers.

use lattice_artifacts::{ArtifactBroker, MANIFEST_FILE};
use lattice_core::JobId;
use lattice_core::artifact::Producer;
use std::sync::Arc;
use tokio::task::JoinSet;

#[tokio::test]
async fn test_concurrent_publish_then_merge() {
    let broker = Arc::new(ArtifactBroker::default());

    let mut tasks = JoinSet::new();
    for i in 0..8 {
        let broker = broker.clone();
        tasks.spawn(async move {
            let job = JobId::for_coordinate("build", [i.to_string().as_str()]);
            // Two instances produce identical content.
            let content = format!("wheel {}", i % 4).into_bytes();
            broker.publish(&job, &format!("wheel-{}", i), content).await
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap().unwrap();
    }

    let found = broker.fetch("wheel-*").await.unwrap();
    assert_eq!(found.len(), 8);
    let names: Vec<&str> = found.iter().map(|a| a.name.as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted);

    let merged = broker.merge(&found, "wheels").await.unwrap();
    assert_eq!(merged.parts.len(), 4);
    assert_eq!(merged.producer.jobs().len(), 8);
    assert!(matches!(merged.producer, Producer::Merge(_)));

    // Merging again returns the existing artifact.
    let again = broker.merge(&found, "wheels").await.unwrap();
    assert_eq!(again.id, merged.id);
    assert_eq!(broker.history("wheels").await.len(), 1);
}

#[tokio::test]
async fn test_export_writes_latest_versions() {
    let broker = ArtifactBroker::default();
    let job = JobId::new("package");
    broker.publish(&job, "sdist", b"v1".to_vec()).await.unwrap();
    broker.publish(&job, "sdist", b"v2".to_vec()).await.unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let exported = broker.export_to(dir.path()).await.unwrap();

    assert_eq!(exported.len(), 1);
    assert_eq!(std::fs::read(dir.path().join("sdist")).unwrap(), b"v2");
    assert!(dir.path().join(MANIFEST_FILE).exists());

    broker.release().await;
    assert!(broker.read(&broker.latest().await[0]).await.is_err());
}
