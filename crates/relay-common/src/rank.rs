//! Matcher ranking
//!
//! One ordering is used both inside a kind (by the candidate repository) and
//! across kinds (by the decision engine): tenant-owned before group-owned,
//! then priority descending, then id descending.

use crate::{MatcherId, PolicyMatcher, TenantId};

/// Sort key; the greatest key wins.
#[inline]
pub fn rank_key(matcher: &PolicyMatcher, tenant_id: TenantId) -> (bool, i32, MatcherId) {
    (matcher.owner.is_tenant(tenant_id), matcher.priority, matcher.id)
}

/// Pick the best-ranked matcher for a tenant
pub fn best_candidate<'a, I>(candidates: I, tenant_id: TenantId) -> Option<&'a PolicyMatcher>
where
    I: IntoIterator<Item = &'a PolicyMatcher>,
{
    candidates
        .into_iter()
        .max_by_key(|matcher| rank_key(matcher, tenant_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, MatchPayload, MatcherOwner, RuleStatus};

    fn matcher(id: MatcherId, owner: MatcherOwner, priority: i32) -> PolicyMatcher {
        PolicyMatcher {
            id,
            owner,
            rule_id: 1,
            payload: MatchPayload::DomainSuffix("com.example.".into()),
            action: Action::Reject,
            target_id: None,
            priority,
            status: RuleStatus::Enabled,
        }
    }

    #[test]
    fn test_tenant_beats_priority() {
        let rows = vec![
            matcher(1, MatcherOwner::Group(9), 100),
            matcher(2, MatcherOwner::Tenant(5), 1),
        ];
        assert_eq!(best_candidate(&rows, 5).unwrap().id, 2);
    }

    #[test]
    fn test_priority_then_id() {
        let rows = vec![
            matcher(3, MatcherOwner::Group(9), 10),
            matcher(4, MatcherOwner::Group(9), 20),
        ];
        assert_eq!(best_candidate(&rows, 5).unwrap().id, 4);

        let rows = vec![
            matcher(5, MatcherOwner::Group(9), 10),
            matcher(9, MatcherOwner::Group(9), 10),
        ];
        assert_eq!(best_candidate(&rows, 5).unwrap().id, 9);
    }

    #[test]
    fn test_empty() {
        let rows: Vec<PolicyMatcher> = vec![];
        assert!(best_candidate(&rows, 1).is_none());
    }
}
