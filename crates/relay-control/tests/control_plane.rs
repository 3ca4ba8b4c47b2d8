//! End-to-end tests over the SQLite backend

use chrono::{DateTime, Duration, Utc};
use relay_common::{
    Action, Credentials, FlowDirection, ForwardTarget, IpRange, MatchPayload, MatcherOwner,
    PeriodUnit, PolicyMatcher, RuleStatus, Subscription, SubscriptionStatus, TlsOptions,
};
use relay_control::{ConnectionReport, ControlConfig, ControlPlane};
use relay_policy::reverse_labels;
use relay_store::SqliteStore;
use std::sync::Arc;

const TENANT: i64 = 7;
const GROUP: i64 = 70;
const RULE: i64 = 1;

fn matcher(id: i64, owner: MatcherOwner, payload: MatchPayload, action: Action, target_id: Option<i64>, priority: i32) -> PolicyMatcher {
    PolicyMatcher {
        id,
        owner,
        rule_id: RULE,
        payload,
        action,
        target_id,
        priority,
        status: RuleStatus::Enabled,
    }
}

fn target(id: i64, address: &str, status: RuleStatus) -> ForwardTarget {
    ForwardTarget {
        id,
        protocol: "socks5".into(),
        address: address.into(),
        credentials: Some(Credentials { username: "edge".into(), password: "secret".into() }),
        tls: TlsOptions { sni_guard: true, ..TlsOptions::default() },
        status,
    }
}

fn config() -> ControlConfig {
    let mut config = ControlConfig::default();
    config.traffic.max_batch = 4;
    config.usage.max_batch = 4;
    config
}

async fn seeded() -> Arc<SqliteStore> {
    let store = SqliteStore::in_memory().await.unwrap();
    let rows = [
        matcher(1, MatcherOwner::Group(GROUP), MatchPayload::DomainSuffix(reverse_labels("example.com")), Action::Forward, Some(100), 10),
        matcher(2, MatcherOwner::Tenant(TENANT), MatchPayload::DomainExact("api.example.com".into()), Action::Reject, None, 0),
        matcher(3, MatcherOwner::Group(GROUP), MatchPayload::Cidr(IpRange::from_cidr("203.0.113.0/24").unwrap()), Action::Forward, Some(101), 5),
        matcher(4, MatcherOwner::Group(GROUP), MatchPayload::DomainExact("loop.example.net".into()), Action::Forward, Some(102), 5),
        matcher(5, MatcherOwner::Tenant(TENANT), MatchPayload::Ip(IpRange::single("203.0.113.66".parse().unwrap())), Action::Direct, None, 0),
    ];
    for row in &rows {
        store.upsert_matcher(row).await.unwrap();
    }
    store.upsert_target(&target(100, "proxy.example.net:1080", RuleStatus::Enabled)).await.unwrap();
    store.upsert_target(&target(101, "proxy2.example.net:1080", RuleStatus::Disabled)).await.unwrap();
    store.upsert_target(&target(102, "127.0.0.1:1080", RuleStatus::Enabled)).await.unwrap();
    Arc::new(store)
}

#[tokio::test]
async fn test_decisions_end_to_end() {
    let store = seeded().await;
    let plane = ControlPlane::start(Arc::clone(&store), &config());

    // group suffix forward
    let decision = plane.decide(TENANT, GROUP, RULE, "www.Example.com:443").await.unwrap();
    assert_eq!(decision.action, Action::Forward);
    assert_eq!(decision.matcher_id, Some(1));
    let forward = decision.forward.unwrap();
    assert_eq!(forward.address, "proxy.example.net:1080");
    assert!(forward.tls.sni_guard);

    // tenant-owned exact row wins over the group suffix
    let decision = plane.decide(TENANT, GROUP, RULE, "api.example.com").await.unwrap();
    assert_eq!((decision.action, decision.matcher_id), (Action::Reject, Some(2)));

    // suffix needs a label boundary
    let decision = plane.decide(TENANT, GROUP, RULE, "notexample.com:443").await.unwrap();
    assert!(!decision.matched);

    // disabled target degrades
    let decision = plane.decide(TENANT, GROUP, RULE, "203.0.113.9:22").await.unwrap();
    assert_eq!((decision.matched, decision.action), (true, Action::Direct));
    assert!(decision.forward.is_none());

    // tenant single-address row beats the group block
    let decision = plane.decide(TENANT, GROUP, RULE, "203.0.113.66:22").await.unwrap();
    assert_eq!((decision.matched, decision.action, decision.matcher_id), (true, Action::Direct, Some(5)));

    // protected target and protected destination
    let decision = plane.decide(TENANT, GROUP, RULE, "loop.example.net:80").await.unwrap();
    assert_eq!(decision.action, Action::Reject);
    let decision = plane.decide(TENANT, GROUP, RULE, "[::ffff:127.0.0.1]:8080").await.unwrap();
    assert_eq!((decision.matched, decision.action), (false, Action::Reject));

    // other group sees nothing
    let decision = plane.decide(TENANT + 1, GROUP + 1, RULE, "www.example.com").await.unwrap();
    assert!(!decision.matched);

    let stats = plane.stats().policy;
    assert_eq!(stats.decisions, 8);
    assert_eq!(stats.degraded_forwards, 1);
    assert_eq!(stats.protected_rejects, 2);
    plane.shutdown().await;
}

fn connection(tenant_id: i64, closed_at: DateTime<Utc>, up: u64, down: u64) -> ConnectionReport {
    ConnectionReport {
        tenant_id,
        direction: FlowDirection::Outbound,
        listen: "0.0.0.0:1080".into(),
        source: "192.0.2.1:50000".into(),
        target: "www.example.com:443".into(),
        protocol: "tcp".into(),
        bytes_up: up,
        bytes_down: down,
        opened_at: closed_at - Duration::seconds(5),
        closed_at,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reports_reach_storage() {
    let store = seeded().await;
    let plane = Arc::new(ControlPlane::start(Arc::clone(&store), &config()));

    let today = Utc::now();
    let yesterday = today - Duration::days(1);
    let handles: Vec<_> = (0..10u64)
        .map(|task| {
            let plane = Arc::clone(&plane);
            tokio::spawn(async move {
                for i in 0..30u64 {
                    let closed_at = if i % 2 == 0 { today } else { yesterday };
                    plane.report(connection((task % 3) as i64 + 1, closed_at, i, 1)).await;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let report = plane.shutdown().await;
    assert_eq!(report.lost(), 0);

    // tenants 1, 2, 3 served by 4, 3 and 3 tasks
    let per_task_up: u64 = (0..30).sum();
    assert_eq!(store.usage(1).await.unwrap(), (4 * per_task_up, 4 * 30));
    assert_eq!(store.usage(2).await.unwrap(), (3 * per_task_up, 3 * 30));
    assert_eq!(store.usage(3).await.unwrap(), (3 * per_task_up, 3 * 30));

    let today_rows = store.traffic_count(relay_common::DayPartition::of(today)).await.unwrap();
    let yesterday_rows = store.traffic_count(relay_common::DayPartition::of(yesterday)).await.unwrap();
    assert_eq!(today_rows + yesterday_rows, 300);
    assert_eq!(today_rows, 150);
}

fn subscription(id: i64, status: SubscriptionStatus, left: i32, expiry: DateTime<Utc>) -> Subscription {
    Subscription {
        id,
        tenant_id: id,
        status,
        period_unit: PeriodUnit::Day,
        period_left: left,
        start_time: expiry - Duration::days(1),
        expiry_time: expiry,
    }
}

#[tokio::test]
async fn test_sweep_over_sqlite() {
    let store = seeded().await;
    // rows sit in the future so the background tick leaves them alone
    let base = Utc::now() + Duration::days(30);
    store.upsert_subscription(&subscription(1, SubscriptionStatus::Enabled, 3, base)).await.unwrap();
    store.upsert_subscription(&subscription(2, SubscriptionStatus::Enabled, 0, base + Duration::days(2))).await.unwrap();
    store.upsert_subscription(&subscription(3, SubscriptionStatus::Expired, 0, base - Duration::days(2))).await.unwrap();
    store.upsert_subscription(&subscription(4, SubscriptionStatus::Enabled, -1, base + Duration::days(1))).await.unwrap();

    let plane = ControlPlane::start(Arc::clone(&store), &config());
    let now = base + Duration::days(4);
    let report = plane.sweep().tick_at(now).await;
    assert_eq!((report.expired, report.disabled, report.renewed, report.errors), (1, 1, 2, 0));

    let renewed = store.subscription(1).await.unwrap().unwrap();
    assert_eq!(renewed.expiry_time.timestamp_millis(), (base + Duration::days(3)).timestamp_millis());
    assert_eq!(renewed.period_left, 0);

    let unlimited = store.subscription(4).await.unwrap().unwrap();
    assert!(unlimited.expiry_time > now);
    assert_eq!(unlimited.period_left, -1);

    assert_eq!(store.subscription(2).await.unwrap().unwrap().status, SubscriptionStatus::Expired);
    assert_eq!(store.subscription(3).await.unwrap().unwrap().status, SubscriptionStatus::Disabled);

    // second tick finds nothing new except the now-terminal renewed row
    let report = plane.sweep().tick_at(now).await;
    assert_eq!((report.expired, report.renewed), (1, 0));
    plane.shutdown().await;
}
