//! In-memory storage backend
//!
//! Implements every storage trait over `parking_lot` tables. Used by unit
//! tests across the workspace, so it also carries failure injection and
//! counters for partition creation.

use crate::repo::{
    AccountingStore, CandidateQuery, PolicyRepository, RenewCursor, RenewalUpdate,
    SubscriptionStore, Transition,
};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use relay_common::{
    best_candidate, AtomicCounter, DayPartition, ForwardTarget, MatchPayload, PolicyMatcher,
    Subscription, SubscriptionId, SubscriptionStatus, TargetId, TenantId, TrafficRecord,
    UsageDelta,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::time::Duration;

#[derive(Debug, Default)]
struct Faults {
    candidates: bool,
    targets: bool,
    ensure: bool,
    writes: bool,
    partitions: HashSet<DayPartition>,
    renewals: HashSet<SubscriptionId>,
    ensure_delay: Option<Duration>,
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    matchers: RwLock<Vec<PolicyMatcher>>,
    targets: RwLock<HashMap<TargetId, ForwardTarget>>,
    traffic: RwLock<HashMap<DayPartition, Vec<TrafficRecord>>>,
    usage: RwLock<HashMap<TenantId, (u64, u64)>>,
    subscriptions: RwLock<BTreeMap<SubscriptionId, Subscription>>,
    faults: RwLock<Faults>,
    ensure_calls: AtomicCounter,
    partitions_created: AtomicCounter,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    // === Seeding ===

    /// Add a matcher row
    pub fn insert_matcher(&self, matcher: PolicyMatcher) {
        self.matchers.write().push(matcher);
    }

    /// Add or replace a forward target
    pub fn insert_target(&self, target: ForwardTarget) {
        self.targets.write().insert(target.id, target);
    }

    /// Add or replace a subscription
    pub fn insert_subscription(&self, subscription: Subscription) {
        self.subscriptions.write().insert(subscription.id, subscription);
    }

    // === Inspection ===

    /// Current subscription row
    pub fn subscription(&self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions.read().get(&id).cloned()
    }

    /// Cumulative `(up, down)` for a tenant
    pub fn usage(&self, tenant_id: TenantId) -> (u64, u64) {
        self.usage.read().get(&tenant_id).copied().unwrap_or((0, 0))
    }

    /// Rows written to a day's partition, in insert order
    pub fn traffic(&self, day: DayPartition) -> Vec<TrafficRecord> {
        self.traffic.read().get(&day).cloned().unwrap_or_default()
    }

    /// Whether the day's partition exists
    pub fn has_partition(&self, day: DayPartition) -> bool {
        self.traffic.read().contains_key(&day)
    }

    /// Number of `ensure_partition` calls that reached the store
    pub fn ensure_calls(&self) -> u64 {
        self.ensure_calls.get()
    }

    /// Number of partitions actually created
    pub fn partitions_created(&self) -> u64 {
        self.partitions_created.get()
    }

    // === Failure injection ===

    /// Make candidate lookups fail
    pub fn fail_candidates(&self, fail: bool) {
        self.faults.write().candidates = fail;
    }

    /// Make forward target lookups fail
    pub fn fail_targets(&self, fail: bool) {
        self.faults.write().targets = fail;
    }

    /// Make every partition ensure fail
    pub fn fail_ensure(&self, fail: bool) {
        self.faults.write().ensure = fail;
    }

    /// Make every traffic insert and usage increment fail
    pub fn fail_writes(&self, fail: bool) {
        self.faults.write().writes = fail;
    }

    /// Make writes to one partition fail
    pub fn fail_partition(&self, day: DayPartition, fail: bool) {
        let mut faults = self.faults.write();
        if fail {
            faults.partitions.insert(day);
        } else {
            faults.partitions.remove(&day);
        }
    }

    /// Make renewal of one subscription fail
    pub fn fail_renewal(&self, id: SubscriptionId, fail: bool) {
        let mut faults = self.faults.write();
        if fail {
            faults.renewals.insert(id);
        } else {
            faults.renewals.remove(&id);
        }
    }

    /// Delay every partition ensure
    pub fn set_ensure_delay(&self, delay: Option<Duration>) {
        self.faults.write().ensure_delay = delay;
    }

    fn injected(what: &str) -> StoreError {
        StoreError::Unavailable(format!("injected {} failure", what))
    }
}

fn eligible<'a>(
    matchers: &'a [PolicyMatcher],
    query: &'a CandidateQuery,
) -> impl Iterator<Item = &'a PolicyMatcher> + 'a {
    matchers.iter().filter(move |m| {
        m.is_enabled()
            && m.rule_id == query.rule_id
            && m.owner.is_visible_to(query.tenant_id, query.group_id)
    })
}

#[async_trait]
impl PolicyRepository for MemoryStore {
    async fn find_candidates(&self, query: &CandidateQuery) -> StoreResult<Vec<PolicyMatcher>> {
        if self.faults.read().candidates {
            return Err(Self::injected("candidate lookup"));
        }

        let matchers = self.matchers.read();
        let rows: &[PolicyMatcher] = &matchers;

        let by_ip = query.ip.and_then(|ip| {
            let hits = eligible(rows, query)
                .filter(|m| m.payload.ip_range().map_or(false, |r| r.contains(&ip)));
            best_candidate(hits, query.tenant_id)
        });
        let by_exact = query.host.as_deref().and_then(|host| {
            let hits = eligible(rows, query)
                .filter(|m| matches!(&m.payload, MatchPayload::DomainExact(d) if d == host));
            best_candidate(hits, query.tenant_id)
        });
        let by_suffix = query.reversed_host.as_deref().and_then(|rev| {
            let hits = eligible(rows, query).filter(|m| {
                matches!(&m.payload, MatchPayload::DomainSuffix(d) if rev.starts_with(d.as_str()))
            });
            best_candidate(hits, query.tenant_id)
        });

        Ok([by_ip, by_exact, by_suffix]
            .into_iter()
            .flatten()
            .cloned()
            .collect())
    }

    async fn forward_target(&self, id: TargetId) -> StoreResult<Option<ForwardTarget>> {
        if self.faults.read().targets {
            return Err(Self::injected("forward target lookup"));
        }
        Ok(self.targets.read().get(&id).cloned())
    }
}

#[async_trait]
impl AccountingStore for MemoryStore {
    async fn ensure_partition(&self, day: DayPartition) -> StoreResult<()> {
        self.ensure_calls.inc();
        let (delay, fail) = {
            let faults = self.faults.read();
            (faults.ensure_delay, faults.ensure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Self::injected("partition ensure"));
        }

        let mut traffic = self.traffic.write();
        if !traffic.contains_key(&day) {
            traffic.insert(day, Vec::new());
            self.partitions_created.inc();
        }
        Ok(())
    }

    async fn insert_batch(&self, day: DayPartition, records: &[TrafficRecord]) -> StoreResult<()> {
        {
            let faults = self.faults.read();
            if faults.writes || faults.partitions.contains(&day) {
                return Err(Self::injected("traffic insert"));
            }
        }
        let mut traffic = self.traffic.write();
        let rows = traffic
            .get_mut(&day)
            .ok_or_else(|| StoreError::Unavailable(format!("partition {} does not exist", day)))?;
        rows.extend_from_slice(records);
        Ok(())
    }

    async fn increment_counters_batch(&self, deltas: &[UsageDelta]) -> StoreResult<()> {
        if self.faults.read().writes {
            return Err(Self::injected("usage increment"));
        }
        let mut usage = self.usage.write();
        for delta in deltas {
            let entry = usage.entry(delta.tenant_id).or_insert((0, 0));
            entry.0 = entry.0.saturating_add(delta.up);
            entry.1 = entry.1.saturating_add(delta.down);
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn scan_transition(
        &self,
        transition: &Transition,
        after_id: Option<SubscriptionId>,
        limit: usize,
    ) -> StoreResult<Vec<SubscriptionId>> {
        Ok(self
            .subscriptions
            .read()
            .range((after_id.map_or(Bound::Unbounded, Bound::Excluded), Bound::Unbounded))
            .filter(|(_, sub)| transition.matches(sub))
            .map(|(id, _)| *id)
            .take(limit)
            .collect())
    }

    async fn apply_transition(
        &self,
        transition: &Transition,
        ids: &[SubscriptionId],
    ) -> StoreResult<u64> {
        let mut subscriptions = self.subscriptions.write();
        let mut updated = 0;
        for id in ids {
            if let Some(sub) = subscriptions.get_mut(id) {
                if transition.matches(sub) {
                    sub.status = transition.target_status();
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn scan_renewable(
        &self,
        now: DateTime<Utc>,
        cursor: Option<RenewCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read();
        let mut rows: Vec<Subscription> = subscriptions
            .values()
            .filter(|sub| {
                sub.status == SubscriptionStatus::Enabled
                    && sub.has_remaining_periods()
                    && sub.expiry_time <= now
                    && cursor.map_or(true, |c| RenewCursor::at(sub) > c)
            })
            .cloned()
            .collect();
        rows.sort_by_key(RenewCursor::at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn renew_if_unchanged(&self, update: &RenewalUpdate) -> StoreResult<bool> {
        if self.faults.read().renewals.contains(&update.id) {
            return Err(Self::injected("renewal"));
        }
        let mut subscriptions = self.subscriptions.write();
        match subscriptions.get_mut(&update.id) {
            Some(sub) if update.precondition_holds(sub) => {
                sub.start_time = update.start_time;
                sub.expiry_time = update.expiry_time;
                sub.period_left = update.period_left;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use relay_common::{
        Action, IpRange, MatcherOwner, PeriodUnit, RuleStatus, FlowDirection,
    };
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn matcher(id: i64, owner: MatcherOwner, payload: MatchPayload, priority: i32) -> PolicyMatcher {
        PolicyMatcher {
            id,
            owner,
            rule_id: 1,
            payload,
            action: Action::Reject,
            target_id: None,
            priority,
            status: RuleStatus::Enabled,
        }
    }

    fn query(ip: Option<[u8; 16]>, host: Option<&str>, rev: Option<&str>) -> CandidateQuery {
        CandidateQuery {
            tenant_id: 1,
            group_id: 10,
            rule_id: 1,
            ip,
            host: host.map(String::from),
            reversed_host: rev.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_candidates_one_per_class() {
        let store = MemoryStore::new();
        let range = IpRange::from_cidr("10.0.0.0/8").unwrap();
        store.insert_matcher(matcher(1, MatcherOwner::Group(10), MatchPayload::Cidr(range), 5));
        store.insert_matcher(matcher(2, MatcherOwner::Tenant(1), MatchPayload::Cidr(range), 1));
        store.insert_matcher(matcher(3, MatcherOwner::Group(10), MatchPayload::DomainSuffix("com.example.".into()), 1));
        store.insert_matcher(matcher(4, MatcherOwner::Group(10), MatchPayload::DomainSuffix("com.".into()), 9));
        store.insert_matcher(matcher(5, MatcherOwner::Group(99), MatchPayload::DomainExact("a.example.com".into()), 9));

        let ip = relay_common::ip16("10.1.1.1".parse().unwrap());
        let found = store
            .find_candidates(&query(Some(ip), Some("a.example.com"), Some("com.example.a.")))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|m| m.id).collect();
        // tenant-owned cidr beats higher-priority group row; group 99 invisible
        assert_eq!(ids, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_suffix_requires_label_boundary() {
        let store = MemoryStore::new();
        store.insert_matcher(matcher(1, MatcherOwner::Tenant(1), MatchPayload::DomainSuffix("com.example.".into()), 0));

        let hit = store.find_candidates(&query(None, Some("example.com"), Some("com.example."))).await.unwrap();
        assert_eq!(hit.len(), 1);

        let miss = store.find_candidates(&query(None, Some("myexample.com"), Some("com.myexample."))).await.unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_and_other_rule_ignored() {
        let store = MemoryStore::new();
        let mut disabled = matcher(1, MatcherOwner::Tenant(1), MatchPayload::DomainExact("x.io".into()), 0);
        disabled.status = RuleStatus::Disabled;
        store.insert_matcher(disabled);
        let mut other_rule = matcher(2, MatcherOwner::Tenant(1), MatchPayload::DomainExact("x.io".into()), 0);
        other_rule.rule_id = 2;
        store.insert_matcher(other_rule);

        let found = store.find_candidates(&query(None, Some("x.io"), Some("io.x."))).await.unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_insert_requires_partition() {
        let store = MemoryStore::new();
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let day = DayPartition::of(time);
        let record = TrafficRecord {
            time,
            tenant_id: 1,
            direction: FlowDirection::Outbound,
            listen: "0.0.0.0:1080".into(),
            source: "192.0.2.1:5000".into(),
            target: "example.com:443".into(),
            protocol: "tcp".into(),
            bytes_up: 10,
            bytes_down: 20,
            duration: Duration::from_millis(1500),
        };

        tokio_test::block_on(async {
            assert_err!(store.insert_batch(day, &[record.clone()]).await);
            assert_ok!(store.ensure_partition(day).await);
            assert_ok!(store.ensure_partition(day).await);
            assert_ok!(store.insert_batch(day, &[record.clone()]).await);
        });
        assert_eq!(store.traffic(day), vec![record]);
        assert_eq!(store.partitions_created(), 1);
        assert_eq!(store.ensure_calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_renewal_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let expiry = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        store.insert_subscription(Subscription {
            id: 1,
            tenant_id: 1,
            status: SubscriptionStatus::Enabled,
            period_unit: PeriodUnit::Day,
            period_left: 3,
            start_time: expiry - ChronoDuration::days(1),
            expiry_time: expiry,
        });
        let update = RenewalUpdate {
            id: 1,
            expected_expiry: expiry,
            start_time: expiry,
            expiry_time: expiry + ChronoDuration::days(1),
            period_left: 2,
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.renew_if_unchanged(&update).await.unwrap() })
            })
            .collect();
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.subscription(1).unwrap().period_left, 2);
    }
}
