//! End-to-end tests wiring registry, engine, monitor, alarms, and
//! notification channels together.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tp_common::{AlarmThresholds, ChangeSource, NotifyTargets, QueueCapacity};
use tp_control::{
    AlarmEvaluator, ChangeProposal, ControlConfig, IdLockRegistry, LifecycleManager, Monitor,
    NotifierDispatcher, PoolBuilder, PoolRegistry, ReconfigEngine, WebhookChannel,
};

fn control_plane() -> (Arc<PoolRegistry>, Arc<IdLockRegistry>) {
    (
        Arc::new(PoolRegistry::new()),
        Arc::new(IdLockRegistry::new()),
    )
}

#[tokio::test]
async fn reconfigure_and_observe_through_registry() {
    let (registry, locks) = control_plane();

    PoolBuilder::new("orders")
        .core_size(2)
        .max_size(4)
        .queue_capacity(QueueCapacity::Bounded(10))
        .register(&registry)
        .unwrap();

    let engine = ReconfigEngine::new(registry.clone(), locks);

    let mut proposed = registry.get("orders").unwrap().config();
    proposed.core_size = 4;
    let event = engine
        .apply(proposed, ChangeSource::Dashboard)
        .await
        .unwrap()
        .expect("a real change");

    let change = &event.changes["coreSize"];
    assert_eq!(change.before, "2");
    assert_eq!(change.after, "4");

    // list() shows the new snapshot
    let listed = registry.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].config().core_size, 4);
    assert_eq!(listed[0].executor.core_size(), 4);
}

#[tokio::test]
async fn change_event_reaches_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .and(body_partial_json(serde_json::json!({
            "type": "configChange",
            "poolId": "orders",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (registry, locks) = control_plane();
    PoolBuilder::new("orders")
        .core_size(2)
        .max_size(4)
        .notify_targets(NotifyTargets {
            channels: vec!["webhook".to_string()],
            recipients: vec!["oncall".to_string()],
        })
        .register(&registry)
        .unwrap();

    let mut dispatcher = NotifierDispatcher::new();
    dispatcher.register_channel(Arc::new(
        WebhookChannel::new("webhook", format!("{}/notify", server.uri())).unwrap(),
    ));
    let engine =
        ReconfigEngine::new(registry.clone(), locks).with_dispatcher(Arc::new(dispatcher));

    let mut proposed = registry.get("orders").unwrap().config();
    proposed.core_size = 3;
    engine
        .apply(proposed, ChangeSource::RemoteConfig)
        .await
        .unwrap();
}

#[tokio::test]
async fn alarm_fires_once_per_quiet_window() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alarms"))
        .and(body_partial_json(serde_json::json!({
            "type": "alarm",
            "poolId": "orders",
            "metric": "queueUsage",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (registry, _locks) = control_plane();
    let mut thresholds = AlarmThresholds::default();
    thresholds.quiet_window = Duration::from_secs(300);
    // Active ratio stays quiet so only queue usage fires
    thresholds.active_ratio_threshold = 2.0;
    thresholds.reject_count_threshold = 1000;

    let instance = PoolBuilder::new("orders")
        .core_size(1)
        .max_size(1)
        .queue_capacity(QueueCapacity::Bounded(10))
        .alarm_thresholds(thresholds)
        .notify_targets(NotifyTargets {
            channels: vec!["webhook".to_string()],
            recipients: vec![],
        })
        .register(&registry)
        .unwrap();

    // Fill: one job running, nine queued -> usage 0.9 > 0.8
    let (release_tx, _keep) = broadcast::channel::<()>(1);
    for _ in 0..10 {
        let mut rx = release_tx.subscribe();
        instance
            .executor
            .submit(async move {
                let _ = rx.recv().await;
            })
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut dispatcher = NotifierDispatcher::new();
    dispatcher.register_channel(Arc::new(
        WebhookChannel::new("webhook", format!("{}/alarms", server.uri())).unwrap(),
    ));
    let evaluator = AlarmEvaluator::new(registry, Arc::new(dispatcher));

    let first = evaluator.evaluate_tick().await;
    assert_eq!(first.len(), 1);
    assert!((first[0].observed - 0.9).abs() < 1e-9);

    // Breach persists but the quiet window suppresses the repeat
    let second = evaluator.evaluate_tick().await;
    assert!(second.is_empty());

    let _ = release_tx.send(());
}

#[tokio::test]
async fn failing_webhook_does_not_starve_healthy_one() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&healthy)
        .await;

    let (registry, locks) = control_plane();
    PoolBuilder::new("orders")
        .core_size(1)
        .max_size(2)
        .notify_targets(NotifyTargets {
            channels: vec!["primary".to_string(), "secondary".to_string()],
            recipients: vec![],
        })
        .register(&registry)
        .unwrap();

    let mut dispatcher = NotifierDispatcher::new();
    dispatcher.register_channel(Arc::new(
        WebhookChannel::new("primary", failing.uri()).unwrap(),
    ));
    dispatcher.register_channel(Arc::new(
        WebhookChannel::new("secondary", healthy.uri()).unwrap(),
    ));
    let engine =
        ReconfigEngine::new(registry.clone(), locks).with_dispatcher(Arc::new(dispatcher));

    let mut proposed = registry.get("orders").unwrap().config();
    proposed.max_size = 4;
    // Succeeds despite the failing channel
    let event = engine.apply(proposed, ChangeSource::Dashboard).await.unwrap();
    assert!(event.is_some());
}

#[tokio::test]
async fn sampling_stays_responsive_during_reconfiguration_storm() {
    let (registry, locks) = control_plane();
    for i in 0..4 {
        PoolBuilder::new(format!("pool-{i}"))
            .core_size(1)
            .max_size(8)
            .register(&registry)
            .unwrap();
    }

    let engine = Arc::new(ReconfigEngine::new(registry.clone(), locks));
    let monitor = Monitor::new(registry.clone());

    let mut handles = Vec::new();
    for round in 0..20u32 {
        let engine = engine.clone();
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("pool-{}", round % 4);
            let mut config = registry.get(&id).unwrap().config();
            config.core_size = 1 + (round % 4);
            let _ = engine.apply(config, ChangeSource::RemoteConfig).await;
        }));
    }

    // Monitor ticks interleave with the storm; each completes promptly
    for _ in 0..10 {
        let sampled = monitor.tick();
        assert_eq!(sampled, 4);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for handle in handles {
        handle.await.unwrap();
    }

    // Snapshots and executors agree after the dust settles
    for instance in registry.list() {
        assert_eq!(instance.config().core_size, instance.executor.core_size());
    }
}

#[tokio::test]
async fn lifecycle_drives_proposals_from_the_feed() {
    let (registry, locks) = control_plane();
    PoolBuilder::new("orders")
        .core_size(1)
        .max_size(4)
        .register(&registry)
        .unwrap();

    let monitor = Arc::new(Monitor::new(registry.clone()));
    let dispatcher = Arc::new(NotifierDispatcher::new());
    let evaluator = Arc::new(AlarmEvaluator::new(registry.clone(), dispatcher));
    let engine = Arc::new(ReconfigEngine::new(registry.clone(), locks));

    let (tx, rx) = mpsc::channel(8);
    let manager = LifecycleManager::start(
        ControlConfig {
            monitor_interval: Duration::from_millis(20),
            alarm_interval: Duration::from_millis(20),
        },
        monitor,
        evaluator,
        engine,
        Some(rx),
    );

    let mut config = registry.get("orders").unwrap().config();
    config.core_size = 3;
    tx.send(ChangeProposal {
        config,
        source: ChangeSource::RemoteConfig,
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let instance = registry.get("orders").unwrap();
    assert_eq!(instance.config().core_size, 3);
    assert!(instance.latest_sample().is_some());

    tokio::time::timeout(Duration::from_secs(2), manager.shutdown())
        .await
        .expect("bounded shutdown");
}
