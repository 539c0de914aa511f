//! Maintenance operations racing ordinary container operations.

use std::collections::HashSet;
use std::time::Duration;

use berth::{ContainerEngine, EngineContext, ImageEngine};
use berth_protocol::{
    ContainerCreateOptions, ContainerState, ImageListOptions, SystemMigrateOptions,
    SystemRenumberOptions,
};

mod common;
use common::{test_runtime, test_runtime_with};

async fn create(engine: &impl ContainerEngine, name: &str) -> String {
    engine
        .container_create(
            &EngineContext::new(),
            ContainerCreateOptions {
                name: Some(name.to_string()),
                image: "alpine".to_string(),
                oci_runtime: None,
            },
        )
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_start_waits_for_exclusive_lock() {
    let rt = test_runtime().await;
    let containers = rt.containers();
    create(&containers, "web").await;

    let guard = rt.runtime.lock().exclusive().await.unwrap();
    let engine = containers.clone();
    let start = tokio::spawn(async move {
        engine
            .container_start(&EngineContext::new(), "web")
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!start.is_finished(), "start ran while maintenance held the lock");
    let state = rt.runtime.state().unwrap();
    assert_eq!(state.containers[0].state, ContainerState::Created);

    drop(guard);
    tokio::time::timeout(Duration::from_secs(5), start)
        .await
        .expect("start never resumed")
        .unwrap()
        .unwrap();
    let state = rt.runtime.state().unwrap();
    assert_eq!(state.containers[0].state, ContainerState::Running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_renumber_and_start_never_interleave() {
    let rt = test_runtime_with(|mut config| {
        config.num_locks = 64;
        config
    })
    .await;
    let containers = rt.containers();
    for i in 0..8 {
        create(&containers, &format!("c{i}")).await;
    }
    containers
        .container_remove(&EngineContext::new(), "c3", false)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in [0, 1, 2, 4, 5, 6, 7] {
        let engine = containers.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .container_start(&EngineContext::new(), &format!("c{i}"))
                .await
        }));
    }
    let engine = containers.clone();
    let renumber = tokio::spawn(async move {
        engine
            .system_renumber(&EngineContext::new(), SystemRenumberOptions::default())
            .await
    });

    renumber.await.unwrap().unwrap();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let listed = containers
        .container_list(&EngineContext::new())
        .await
        .unwrap();
    assert_eq!(listed.len(), 7);
    assert!(listed.iter().all(|c| c.state == ContainerState::Running));
    let slots: HashSet<u32> = listed.iter().map(|c| c.lock_slot).collect();
    assert_eq!(slots, (0..7).collect::<HashSet<u32>>());
}

#[tokio::test]
async fn test_migrate_rebinds_and_converges() {
    let rt = test_runtime().await;
    let containers = rt.containers();
    let ctx = EngineContext::new();
    create(&containers, "a").await;
    create(&containers, "b").await;
    containers.container_start(&ctx, "a").await.unwrap();

    let opts = SystemMigrateOptions {
        new_runtime: Some("crun".to_string()),
    };
    containers.system_migrate(&ctx, opts.clone()).await.unwrap();
    let first = containers.container_list(&ctx).await.unwrap();
    containers.system_migrate(&ctx, opts).await.unwrap();
    let second = containers.container_list(&ctx).await.unwrap();

    assert_eq!(first, second);
    assert!(first.iter().all(|c| c.oci_runtime == "crun"));
    assert!(first.iter().all(|c| c.state != ContainerState::Running));
}

#[tokio::test]
async fn test_failed_migrate_keeps_original_bindings() {
    let rt = test_runtime().await;
    let containers = rt.containers();
    let ctx = EngineContext::new();
    create(&containers, "a").await;
    containers.container_start(&ctx, "a").await.unwrap();
    let before = containers.container_list(&ctx).await.unwrap();

    let err = containers
        .system_migrate(
            &ctx,
            SystemMigrateOptions {
                new_runtime: Some("../../bin/sh".to_string()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, berth::EngineError::Validation(_)));
    assert_eq!(containers.container_list(&ctx).await.unwrap(), before);
}

#[tokio::test]
async fn test_concurrent_lists_during_reads() {
    let rt = test_runtime().await;
    let images = rt.images();
    let ctx = EngineContext::new();

    let lists = list_concurrently(&images, &ctx).await;
    for list in &lists {
        assert_eq!(list, &lists[0]);
        assert_eq!(list.len(), 2);
    }
}

async fn list_concurrently(
    images: &impl ImageEngine,
    ctx: &EngineContext,
) -> Vec<Vec<berth_protocol::ImageSummary>> {
    let (a, b, c) = tokio::join!(
        images.list(ctx, ImageListOptions::default()),
        images.list(ctx, ImageListOptions::default()),
        images.list(ctx, ImageListOptions::default()),
    );
    vec![a.unwrap(), b.unwrap(), c.unwrap()]
}
