//! Routing decision engine

use crate::normalize::{self, Destination};
use crate::PolicyResult;
use relay_common::{
    best_candidate, Action, AtomicCounter, Credentials, GroupId, MatcherId, PolicyMatcher,
    RuleId, TargetId, TenantId, TlsOptions,
};
use relay_store::{CandidateQuery, PolicyRepository};
use std::sync::Arc;
use tracing::{Instrument, Span};

/// Upstream details for a `forward` decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedForward {
    /// Target row
    pub target_id: TargetId,
    /// Upstream protocol
    pub protocol: String,
    /// Upstream `host:port`
    pub address: String,
    /// Credentials for the upstream
    pub credentials: Option<Credentials>,
    /// TLS options for the upstream
    pub tls: TlsOptions,
}

/// Outcome of one routing decision. `forward` is set iff `action` is
/// [`Action::Forward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether a matcher applied
    pub matched: bool,
    /// Action for the dialer
    pub action: Action,
    /// Winning matcher, if any
    pub matcher_id: Option<MatcherId>,
    /// Resolved upstream
    pub forward: Option<ResolvedForward>,
}

impl Decision {
    /// Unmatched direct connection
    pub fn direct() -> Self {
        Self { matched: false, action: Action::Direct, matcher_id: None, forward: None }
    }

    /// Reject of a protected destination
    pub fn protected() -> Self {
        Self { matched: false, action: Action::Reject, matcher_id: None, forward: None }
    }

    fn matched(matcher_id: MatcherId, action: Action) -> Self {
        Self { matched: true, action, matcher_id: Some(matcher_id), forward: None }
    }
}

/// Policy decision engine
///
/// Stateless apart from counters; safe to share across tasks.
///
/// ```text
/// destination ─► normalize ─┬─ protected ──────────────► reject
///                           ├─ unrecognized ───────────► direct
///                           └─ ip / domain ─► candidates ─► best ─► action
///                                                               │
///                                            forward ─► target ─┴─► degrade / reject
/// ```
pub struct DecisionEngine<R> {
    repo: Arc<R>,
    span: Span,

    // Metrics
    decisions: AtomicCounter,
    matched: AtomicCounter,
    protected_rejects: AtomicCounter,
    degraded_forwards: AtomicCounter,
    lookup_errors: AtomicCounter,
}

impl<R: PolicyRepository> DecisionEngine<R> {
    /// Create engine over a policy repository
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            span: tracing::info_span!("policy"),
            decisions: AtomicCounter::new(0),
            matched: AtomicCounter::new(0),
            protected_rejects: AtomicCounter::new(0),
            degraded_forwards: AtomicCounter::new(0),
            lookup_errors: AtomicCounter::new(0),
        }
    }

    /// Emit events under the given span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Decide how a connection from `tenant_id` to `destination` is routed.
    ///
    /// Only a failed candidate lookup is an error. Unparseable destinations
    /// route direct; unusable forward targets degrade to direct.
    pub async fn decide(
        &self,
        tenant_id: TenantId,
        group_id: GroupId,
        rule_id: RuleId,
        destination: &str,
    ) -> PolicyResult<Decision> {
        self.decisions.inc();
        self.decide_inner(tenant_id, group_id, rule_id, destination)
            .instrument(self.span.clone())
            .await
    }

    async fn decide_inner(
        &self,
        tenant_id: TenantId,
        group_id: GroupId,
        rule_id: RuleId,
        destination: &str,
    ) -> PolicyResult<Decision> {
        let mut query = CandidateQuery {
            tenant_id,
            group_id,
            rule_id,
            ip: None,
            host: None,
            reversed_host: None,
        };
        match normalize::normalize(destination) {
            Destination::Protected => {
                self.protected_rejects.inc();
                tracing::debug!(tenant_id, destination, "protected destination rejected");
                return Ok(Decision::protected());
            }
            Destination::Unrecognized => return Ok(Decision::direct()),
            Destination::Ip(ip) => query.ip = Some(ip),
            Destination::Domain { host, reversed } => {
                query.host = Some(host);
                query.reversed_host = Some(reversed);
            }
        }

        let candidates = self.repo.find_candidates(&query).await.map_err(|e| {
            self.lookup_errors.inc();
            tracing::error!(tenant_id, rule_id, error = %e, "candidate lookup failed");
            e
        })?;

        let Some(winner) = best_candidate(&candidates, tenant_id) else {
            return Ok(Decision::direct());
        };
        self.matched.inc();

        match winner.action {
            Action::Forward => Ok(self.resolve_forward(tenant_id, winner).await),
            action => Ok(Decision::matched(winner.id, action)),
        }
    }

    async fn resolve_forward(&self, tenant_id: TenantId, winner: &PolicyMatcher) -> Decision {
        let degraded = |reason: &str| {
            self.degraded_forwards.inc();
            tracing::warn!(
                tenant_id,
                matcher_id = winner.id,
                target_id = ?winner.target_id,
                reason,
                "forward target unusable, routing direct"
            );
            Decision::matched(winner.id, Action::Direct)
        };

        let Some(target_id) = winner.target_id else {
            return degraded("no target configured");
        };
        let target = match self.repo.forward_target(target_id).await {
            Ok(Some(target)) if !target.is_enabled() => return degraded("target disabled"),
            Ok(Some(target))
                if target.protocol.trim().is_empty() || target.address.trim().is_empty() =>
            {
                return degraded("target incomplete");
            }
            Ok(Some(target)) => target,
            Ok(None) => return degraded("target missing"),
            Err(e) => {
                tracing::warn!(target_id, error = %e, "forward target lookup failed");
                return degraded("target lookup failed");
            }
        };

        if normalize::is_protected(&target.address) {
            self.protected_rejects.inc();
            tracing::warn!(
                tenant_id,
                matcher_id = winner.id,
                target_id,
                "forward target resolves to a protected address"
            );
            return Decision::matched(winner.id, Action::Reject);
        }

        Decision {
            forward: Some(ResolvedForward {
                target_id: target.id,
                protocol: target.protocol,
                address: target.address,
                credentials: target.credentials,
                tls: target.tls,
            }),
            ..Decision::matched(winner.id, Action::Forward)
        }
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            decisions: self.decisions.get(),
            matched: self.matched.get(),
            protected_rejects: self.protected_rejects.get(),
            degraded_forwards: self.degraded_forwards.get(),
            lookup_errors: self.lookup_errors.get(),
        }
    }

    /// Underlying repository
    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }
}

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct EngineStats {
    /// Calls to `decide`
    pub decisions: u64,
    /// Decisions where a matcher applied
    pub matched: u64,
    /// Protected destinations or targets rejected
    pub protected_rejects: u64,
    /// Forward decisions downgraded to direct
    pub degraded_forwards: u64,
    /// Failed candidate lookups
    pub lookup_errors: u64,
}
