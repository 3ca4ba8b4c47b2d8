//! SQLite storage backend
//!
//! All dialect details stay here: table names, placeholder syntax, and the
//! encodings below.
//!
//! | value                 | column type | encoding                         |
//! |-----------------------|-------------|----------------------------------|
//! | IP range bounds       | `BLOB`      | 16 bytes, IPv4 mapped into IPv6  |
//! | enums                 | `TEXT`      | contractual lowercase names      |
//! | timestamps, durations | `INTEGER`   | unix milliseconds                |
//! | byte counters         | `INTEGER`   | saturated to `i64::MAX`          |
//!
//! Traffic rows live in one table per UTC day, named by
//! [`PartitionResolver`].

use crate::repo::{
    AccountingStore, CandidateQuery, PolicyRepository, RenewCursor, RenewalUpdate,
    SubscriptionStore, Transition,
};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_common::{
    Credentials, DayPartition, ForwardTarget, IpRange, MatchPayload, MatcherKind, MatcherOwner,
    PolicyMatcher, Subscription, SubscriptionId, TargetId, TenantId, TlsOptions, TrafficRecord,
    UsageDelta,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Columns per traffic row
const TRAFFIC_COLUMNS: usize = 10;

/// Conservative bind-parameter limit (older SQLite builds cap at 999)
const MAX_BIND_PARAMS: usize = 999;

/// Rows per multi-row insert statement
const ROWS_PER_INSERT: usize = MAX_BIND_PARAMS / TRAFFIC_COLUMNS;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS policy_matchers (
        id          INTEGER PRIMARY KEY,
        tenant_id   INTEGER,
        group_id    INTEGER,
        rule_id     INTEGER NOT NULL,
        kind        TEXT    NOT NULL,
        ip_from     BLOB,
        ip_to       BLOB,
        domain      TEXT,
        action      TEXT    NOT NULL,
        target_id   INTEGER,
        priority    INTEGER NOT NULL DEFAULT 0,
        status      TEXT    NOT NULL DEFAULT 'enabled'
    )",
    "CREATE INDEX IF NOT EXISTS policy_matchers_rule_kind ON policy_matchers (rule_id, kind, status)",
    "CREATE INDEX IF NOT EXISTS policy_matchers_domain ON policy_matchers (domain)",
    "CREATE TABLE IF NOT EXISTS forward_targets (
        id          INTEGER PRIMARY KEY,
        protocol    TEXT    NOT NULL,
        address     TEXT    NOT NULL,
        username    TEXT,
        password    TEXT,
        skip_verify INTEGER NOT NULL DEFAULT 0,
        alpn        TEXT    NOT NULL DEFAULT '',
        fingerprint TEXT,
        sni_guard   INTEGER NOT NULL DEFAULT 0,
        status      TEXT    NOT NULL DEFAULT 'enabled'
    )",
    "CREATE TABLE IF NOT EXISTS tenant_usage (
        tenant_id   INTEGER PRIMARY KEY,
        up          INTEGER NOT NULL DEFAULT 0,
        down        INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS subscriptions (
        id          INTEGER PRIMARY KEY,
        tenant_id   INTEGER NOT NULL,
        status      TEXT    NOT NULL,
        period_unit TEXT    NOT NULL,
        period_left INTEGER NOT NULL,
        start_time  INTEGER NOT NULL,
        expiry_time INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS subscriptions_status_expiry ON subscriptions (status, expiry_time, id)",
];

const MATCHER_COLUMNS: &str =
    "id, tenant_id, group_id, rule_id, kind, ip_from, ip_to, domain, action, target_id, priority, status";

const SUBSCRIPTION_COLUMNS: &str =
    "id, tenant_id, status, period_unit, period_left, start_time, expiry_time";

/// Tenant-owned first, then priority, then newest row
const RANK_ORDER: &str =
    "ORDER BY CASE WHEN tenant_id = ?2 THEN 1 ELSE 0 END DESC, priority DESC, id DESC LIMIT 1";

const ELIGIBLE: &str = "rule_id = ?1 AND status = 'enabled' AND (tenant_id = ?2 OR group_id = ?3)";

/// Maps a day partition to its physical table name
#[derive(Debug, Clone)]
pub struct PartitionResolver {
    prefix: String,
}

impl PartitionResolver {
    /// Default table prefix
    pub const DEFAULT_PREFIX: &'static str = "traffic_log";

    /// Resolver with a custom prefix. Only `[a-z0-9_]` is accepted since the
    /// name is spliced into DDL.
    pub fn new(prefix: &str) -> Option<Self> {
        let valid = !prefix.is_empty()
            && prefix
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        valid.then(|| Self { prefix: prefix.to_string() })
    }

    /// Table holding the day's traffic rows, e.g. `traffic_log_20240309`
    pub fn table(&self, day: DayPartition) -> String {
        format!("{}_{}", self.prefix, day.date().format("%Y%m%d"))
    }
}

impl Default for PartitionResolver {
    fn default() -> Self {
        Self { prefix: Self::DEFAULT_PREFIX.to_string() }
    }
}

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    resolver: PartitionResolver,
}

impl SqliteStore {
    /// Open (creating if missing) a database and bootstrap the schema
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;

        let store = Self { pool, resolver: PartitionResolver::default() };
        store.migrate().await?;
        tracing::info!(url, max_connections, "sqlite store ready");
        Ok(store)
    }

    /// Private in-memory database. The pool pins a single connection so
    /// every query sees the same database.
    pub async fn in_memory() -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool, resolver: PartitionResolver::default() };
        store.migrate().await?;
        Ok(store)
    }

    /// Replace the partition resolver
    pub fn with_resolver(mut self, resolver: PartitionResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Create the static tables. Idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Round-trip a trivial query
    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // === Operator-side writes ===

    /// Insert or replace a matcher row
    pub async fn upsert_matcher(&self, matcher: &PolicyMatcher) -> StoreResult<()> {
        let (tenant_id, group_id) = match matcher.owner {
            MatcherOwner::Tenant(id) => (Some(id), None),
            MatcherOwner::Group(id) => (None, Some(id)),
        };
        let (ip_from, ip_to) = match matcher.payload.ip_range() {
            Some(range) => (Some(range.start().to_vec()), Some(range.end().to_vec())),
            None => (None, None),
        };

        sqlx::query(
            "INSERT OR REPLACE INTO policy_matchers
             (id, tenant_id, group_id, rule_id, kind, ip_from, ip_to, domain, action, target_id, priority, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(matcher.id)
        .bind(tenant_id)
        .bind(group_id)
        .bind(matcher.rule_id)
        .bind(matcher.kind().as_str())
        .bind(ip_from)
        .bind(ip_to)
        .bind(matcher.payload.domain().map(str::to_string))
        .bind(matcher.action.as_str())
        .bind(matcher.target_id)
        .bind(matcher.priority)
        .bind(matcher.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace a forward target
    pub async fn upsert_target(&self, target: &ForwardTarget) -> StoreResult<()> {
        let (username, password) = match &target.credentials {
            Some(c) => (Some(c.username.clone()), Some(c.password.clone())),
            None => (None, None),
        };

        sqlx::query(
            "INSERT OR REPLACE INTO forward_targets
             (id, protocol, address, username, password, skip_verify, alpn, fingerprint, sni_guard, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(target.id)
        .bind(&target.protocol)
        .bind(&target.address)
        .bind(username)
        .bind(password)
        .bind(target.tls.skip_verify)
        .bind(target.tls.alpn.join(","))
        .bind(target.tls.fingerprint.clone())
        .bind(target.tls.sni_guard)
        .bind(target.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace a subscription
    pub async fn upsert_subscription(&self, sub: &Subscription) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO subscriptions
             (id, tenant_id, status, period_unit, period_left, start_time, expiry_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(sub.id)
        .bind(sub.tenant_id)
        .bind(sub.status.as_str())
        .bind(sub.period_unit.as_str())
        .bind(sub.period_left)
        .bind(sub.start_time.timestamp_millis())
        .bind(sub.expiry_time.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === Reads outside the engine traits ===

    /// Subscription by ID
    pub async fn subscription(&self, id: SubscriptionId) -> StoreResult<Option<Subscription>> {
        let sql = format!("SELECT {} FROM subscriptions WHERE id = ?1", SUBSCRIPTION_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(decode_subscription).transpose()
    }

    /// Cumulative `(up, down)` for a tenant
    pub async fn usage(&self, tenant_id: TenantId) -> StoreResult<(u64, u64)> {
        let row = sqlx::query("SELECT up, down FROM tenant_usage WHERE tenant_id = ?1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok((
                from_i64(row.try_get("up")?),
                from_i64(row.try_get("down")?),
            )),
            None => Ok((0, 0)),
        }
    }

    /// Number of rows in a day's traffic table
    pub async fn traffic_count(&self, day: DayPartition) -> StoreResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.resolver.table(day));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(from_i64(count))
    }

    /// Whether the day's traffic table exists
    pub async fn partition_exists(&self, day: DayPartition) -> StoreResult<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")
                .bind(self.resolver.table(day))
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Best eligible row for one matcher class; the lookup key binds as `?4`
    async fn best_of(
        &self,
        predicate: &str,
        query: &CandidateQuery,
        key: Needle,
    ) -> StoreResult<Option<PolicyMatcher>> {
        let sql = format!(
            "SELECT {} FROM policy_matchers WHERE {} AND {} {}",
            MATCHER_COLUMNS, ELIGIBLE, predicate, RANK_ORDER
        );
        let statement = sqlx::query(&sql)
            .bind(query.rule_id)
            .bind(query.tenant_id)
            .bind(query.group_id);
        let statement = match key {
            Needle::Bytes(bytes) => statement.bind(bytes),
            Needle::Text(text) => statement.bind(text),
        };
        let row = statement.fetch_optional(&self.pool).await?;
        row.as_ref().map(decode_matcher).transpose()
    }
}

enum Needle {
    Bytes(Vec<u8>),
    Text(String),
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_time(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", millis)))
}

fn decode_matcher(row: &SqliteRow) -> StoreResult<PolicyMatcher> {
    let id: i64 = row.try_get("id")?;
    let owner = match (row.try_get::<Option<i64>, _>("tenant_id")?, row.try_get::<Option<i64>, _>("group_id")?) {
        (Some(tenant), _) => MatcherOwner::Tenant(tenant),
        (None, Some(group)) => MatcherOwner::Group(group),
        (None, None) => return Err(StoreError::Corrupt(format!("matcher {} has no owner", id))),
    };

    let kind: MatcherKind = row.try_get::<String, _>("kind")?.parse()?;
    let payload = match kind {
        MatcherKind::Ip | MatcherKind::Cidr => {
            let from: Option<Vec<u8>> = row.try_get("ip_from")?;
            let to: Option<Vec<u8>> = row.try_get("ip_to")?;
            let (from, to) = from
                .zip(to)
                .ok_or_else(|| StoreError::Corrupt(format!("matcher {} has no ip range", id)))?;
            let range = IpRange::from_slices(&from, &to)?;
            if kind == MatcherKind::Ip {
                MatchPayload::Ip(range)
            } else {
                MatchPayload::Cidr(range)
            }
        }
        MatcherKind::DomainExact | MatcherKind::DomainSuffix => {
            let domain: Option<String> = row.try_get("domain")?;
            let domain =
                domain.ok_or_else(|| StoreError::Corrupt(format!("matcher {} has no domain", id)))?;
            if kind == MatcherKind::DomainExact {
                MatchPayload::DomainExact(domain)
            } else {
                MatchPayload::DomainSuffix(domain)
            }
        }
    };

    Ok(PolicyMatcher {
        id,
        owner,
        rule_id: row.try_get("rule_id")?,
        payload,
        action: row.try_get::<String, _>("action")?.parse()?,
        target_id: row.try_get("target_id")?,
        priority: row.try_get("priority")?,
        status: row.try_get::<String, _>("status")?.parse()?,
    })
}

fn decode_target(row: &SqliteRow) -> StoreResult<ForwardTarget> {
    let username: Option<String> = row.try_get("username")?;
    let password: Option<String> = row.try_get("password")?;
    let alpn: String = row.try_get("alpn")?;

    Ok(ForwardTarget {
        id: row.try_get("id")?,
        protocol: row.try_get("protocol")?,
        address: row.try_get("address")?,
        credentials: username.map(|username| Credentials {
            username,
            password: password.unwrap_or_default(),
        }),
        tls: TlsOptions {
            skip_verify: row.try_get("skip_verify")?,
            alpn: alpn
                .split(',')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            fingerprint: row.try_get("fingerprint")?,
            sni_guard: row.try_get("sni_guard")?,
        },
        status: row.try_get::<String, _>("status")?.parse()?,
    })
}

fn decode_subscription(row: &SqliteRow) -> StoreResult<Subscription> {
    Ok(Subscription {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        period_unit: row.try_get::<String, _>("period_unit")?.parse()?,
        period_left: row.try_get("period_left")?,
        start_time: to_time(row.try_get("start_time")?)?,
        expiry_time: to_time(row.try_get("expiry_time")?)?,
    })
}

/// Append the transition's row predicate, re-checked on every update
fn push_transition_predicate(builder: &mut QueryBuilder<'_, Sqlite>, transition: &Transition) {
    builder.push(" period_left = 0");
    match *transition {
        Transition::Expire { now, grace_cutoff } => {
            builder.push(" AND status = 'enabled' AND expiry_time <= ");
            builder.push_bind(now.timestamp_millis());
            builder.push(" AND expiry_time > ");
            builder.push_bind(grace_cutoff.timestamp_millis());
        }
        Transition::Disable { grace_cutoff } => {
            builder.push(" AND status IN ('enabled', 'expired') AND expiry_time <= ");
            builder.push_bind(grace_cutoff.timestamp_millis());
        }
    }
}

#[async_trait]
impl PolicyRepository for SqliteStore {
    async fn find_candidates(&self, query: &CandidateQuery) -> StoreResult<Vec<PolicyMatcher>> {
        let mut found = Vec::with_capacity(3);

        if let Some(ip) = query.ip {
            let hit = self
                .best_of(
                    "kind IN ('ip', 'cidr') AND ip_from <= ?4 AND ip_to >= ?4",
                    query,
                    Needle::Bytes(ip.to_vec()),
                )
                .await?;
            found.extend(hit);
        }
        if let Some(host) = &query.host {
            let hit = self
                .best_of("kind = 'domain_exact' AND domain = ?4", query, Needle::Text(host.clone()))
                .await?;
            found.extend(hit);
        }
        if let Some(rev) = &query.reversed_host {
            let hit = self
                .best_of(
                    "kind = 'domain_suffix' AND substr(?4, 1, length(domain)) = domain",
                    query,
                    Needle::Text(rev.clone()),
                )
                .await?;
            found.extend(hit);
        }

        Ok(found)
    }

    async fn forward_target(&self, id: TargetId) -> StoreResult<Option<ForwardTarget>> {
        let row = sqlx::query(
            "SELECT id, protocol, address, username, password, skip_verify, alpn, fingerprint, sni_guard, status
             FROM forward_targets WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_target).transpose()
    }
}

#[async_trait]
impl AccountingStore for SqliteStore {
    async fn ensure_partition(&self, day: DayPartition) -> StoreResult<()> {
        let table = self.resolver.table(day);
        let ddl = [
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    time        INTEGER NOT NULL,
                    tenant_id   INTEGER NOT NULL,
                    direction   TEXT    NOT NULL,
                    listen      TEXT    NOT NULL,
                    source      TEXT    NOT NULL,
                    target      TEXT    NOT NULL,
                    protocol    TEXT    NOT NULL,
                    bytes_up    INTEGER NOT NULL,
                    bytes_down  INTEGER NOT NULL,
                    duration_ms INTEGER NOT NULL
                )"
            ),
            format!("CREATE INDEX IF NOT EXISTS {table}_tenant_time ON {table} (tenant_id, time)"),
            format!("CREATE INDEX IF NOT EXISTS {table}_time ON {table} (time)"),
            format!("CREATE INDEX IF NOT EXISTS {table}_target ON {table} (target)"),
        ];

        let mut tx = self.pool.begin().await?;
        for statement in &ddl {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::debug!(%day, table = %table, "traffic partition ensured");
        Ok(())
    }

    async fn insert_batch(&self, day: DayPartition, records: &[TrafficRecord]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let table = self.resolver.table(day);

        let mut tx = self.pool.begin().await?;
        for chunk in records.chunks(ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {} (time, tenant_id, direction, listen, source, target, protocol, bytes_up, bytes_down, duration_ms) ",
                table
            ));
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.time.timestamp_millis())
                    .push_bind(record.tenant_id)
                    .push_bind(record.direction.as_str())
                    .push_bind(record.listen.clone())
                    .push_bind(record.source.clone())
                    .push_bind(record.target.clone())
                    .push_bind(record.protocol.clone())
                    .push_bind(to_i64(record.bytes_up))
                    .push_bind(to_i64(record.bytes_down))
                    .push_bind(i64::try_from(record.duration.as_millis()).unwrap_or(i64::MAX));
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn increment_counters_batch(&self, deltas: &[UsageDelta]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for delta in deltas {
            sqlx::query(
                "INSERT INTO tenant_usage (tenant_id, up, down) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tenant_id) DO UPDATE SET up = up + excluded.up, down = down + excluded.down",
            )
            .bind(delta.tenant_id)
            .bind(to_i64(delta.up))
            .bind(to_i64(delta.down))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn scan_transition(
        &self,
        transition: &Transition,
        after_id: Option<SubscriptionId>,
        limit: usize,
    ) -> StoreResult<Vec<SubscriptionId>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT id FROM subscriptions WHERE");
        if let Some(after_id) = after_id {
            builder.push(" id > ");
            builder.push_bind(after_id);
            builder.push(" AND");
        }
        push_transition_predicate(&mut builder, transition);
        builder.push(" ORDER BY id LIMIT ");
        builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let ids: Vec<i64> = builder.build_query_scalar::<i64>().fetch_all(&self.pool).await?;
        Ok(ids)
    }

    async fn apply_transition(
        &self,
        transition: &Transition,
        ids: &[SubscriptionId],
    ) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE subscriptions SET status = ");
        builder.push_bind(transition.target_status().as_str());
        builder.push(" WHERE");
        push_transition_predicate(&mut builder, transition);
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn scan_renewable(
        &self,
        now: DateTime<Utc>,
        cursor: Option<RenewCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Subscription>> {
        let (after_expiry, after_id) = cursor
            .map(|c| (c.expiry_time.timestamp_millis(), c.id))
            .unwrap_or((i64::MIN, i64::MIN));

        let sql = format!(
            "SELECT {} FROM subscriptions
             WHERE status = 'enabled' AND (period_left = -1 OR period_left > 0) AND expiry_time <= ?1
               AND (expiry_time > ?2 OR (expiry_time = ?2 AND id > ?3))
             ORDER BY expiry_time, id LIMIT ?4",
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(now.timestamp_millis())
            .bind(after_expiry)
            .bind(after_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_subscription).collect()
    }

    async fn renew_if_unchanged(&self, update: &RenewalUpdate) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET start_time = ?1, expiry_time = ?2, period_left = ?3
             WHERE id = ?4 AND status = 'enabled' AND expiry_time = ?5
               AND (period_left = -1 OR period_left > 0)",
        )
        .bind(update.start_time.timestamp_millis())
        .bind(update.expiry_time.timestamp_millis())
        .bind(update.period_left)
        .bind(update.id)
        .bind(update.expected_expiry.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
