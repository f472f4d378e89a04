//! 路由与投递性能基准测试

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use flare_realtime::config::{DispatchConfig, RoutingConfig};
use flare_realtime::domain::model::{
    ClientIdentity, ClientInfo, MessageType, RealtimeMessage, Subscription, SubscriptionLevel,
};
use flare_realtime::domain::service::{
    ConnectionHandle, ConnectionManager, MessageDispatcher, RoutingEngine, SessionDirectory,
    SubscriberIndex,
};
use flare_realtime::infrastructure::persistence::{DiscardingMessageArchive, InMemorySessionStore};
use flare_realtime::metrics::RealtimeMetrics;
use tokio::runtime::Runtime;

fn bench_routing(c: &mut Criterion) {
    let engine = RoutingEngine::new(&RoutingConfig::default(), Arc::new(SubscriberIndex::new()));

    let messages = vec![
        RealtimeMessage::new(MessageType::TaskProgress, serde_json::json!({"progress": 50}))
            .with_task("task-1")
            .with_organization("org-1"),
        RealtimeMessage::new(MessageType::DeviceAlert, serde_json::json!({"level": "high"}))
            .with_terminal("terminal-1"),
        RealtimeMessage::new(MessageType::UserNotification, serde_json::json!({}))
            .with_recipient("user-1"),
        RealtimeMessage::new(MessageType::Custom("BILLING".to_string()), serde_json::json!({})),
    ];

    let mut group = c.benchmark_group("routing");
    group.throughput(Throughput::Elements(messages.len() as u64));
    group.bench_function("route_mixed_types", |b| {
        b.iter(|| {
            for message in &messages {
                let _ = engine.route(message);
            }
        })
    });
    group.finish();
}

fn bench_topic_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let store = Arc::new(InMemorySessionStore::new());
    let directory = Arc::new(SessionDirectory::new(
        store,
        "bench",
        Duration::from_secs(1800),
        Duration::from_millis(500),
    ));
    let metrics = Arc::new(RealtimeMetrics::standalone());
    let connections = Arc::new(ConnectionManager::new(
        "bench-node",
        directory,
        None,
        metrics.clone(),
    ));
    let index = Arc::new(SubscriberIndex::new());
    let topic = "/topic/org/org-1/announcements";

    // 保留接收端，避免连接被视为已关闭
    let mut receivers = Vec::new();
    rt.block_on(async {
        for i in 0..200 {
            let session_id = format!("session-{}", i);
            let identity = ClientIdentity::new(format!("user-{}", i), "org-1");
            let (handle, rx) = ConnectionHandle::channel(&session_id, 1024);
            connections
                .register_connection(&session_id, &identity, &ClientInfo::default(), handle)
                .await
                .unwrap();
            index.add(Subscription {
                user_id: identity.user_id.clone(),
                session_id,
                topic: topic.to_string(),
                level: SubscriptionLevel::Persistent,
                subscribed_at: Utc::now(),
            });
            receivers.push(rx);
        }
    });

    let routing = Arc::new(RoutingEngine::new(&RoutingConfig::default(), index));
    let dispatcher = MessageDispatcher::new(
        routing,
        connections,
        Arc::new(DiscardingMessageArchive),
        metrics,
        &DispatchConfig::default(),
    );

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(200));
    group.bench_function("org_announcement_200_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let message =
                    RealtimeMessage::new(MessageType::OrgAnnouncement, serde_json::json!({}))
                        .with_organization("org-1");
                dispatcher.dispatch(message).await;
            });
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_routing, bench_topic_fanout);
criterion_main!(benches);
