//! Badge/Summary Projector

use lw_core::SessionId;

use crate::model::Summary;
use crate::store::SessionStore;

/// Project the current counts of a session. Unknown sessions report zeros.
///
/// Always computed from the store, so it reflects the latest completed
/// mutation.
pub fn summarize(store: &SessionStore, id: SessionId) -> Summary {
    store
        .inspect(id, |record| Summary {
            leak_count: record.leak_count,
            violation_count: record.violations.len(),
            policy_match_count: record
                .resources
                .iter()
                .map(|r| r.matched_policies.len())
                .sum(),
        })
        .unwrap_or_default()
}

/// Text shown on the toolbar badge: empty for zero, capped at `999+`.
pub fn badge_text(summary: &Summary) -> String {
    match summary.leak_count {
        0 => String::new(),
        n if n > 999 => "999+".to_string(),
        n => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CspViolation, ObservedResource, Policy};
    use chrono::Utc;
    use lw_core::ResourceType;

    #[test]
    fn test_summary_tracks_store() {
        let store = SessionStore::in_memory();
        let id = SessionId(9);
        assert_eq!(summarize(&store, id), Summary::default());

        store.get_or_create(id);
        let marked = store
            .mark_observed(id, ObservedResource::new("https://a.com/x.js", ResourceType::SCRIPT, None))
            .unwrap();
        store.increment_leak(id);
        store.record_violation(id, CspViolation {
            blocked_uri: "https://a.com/x.js".to_string(),
            violated_directive: "script-src".to_string(),
            document_uri: None,
            first_seen_at: Utc::now(),
        });
        let policy = Policy {
            policy: "block".to_string(),
            surt: "(com,a,".to_string(),
            environment: "prod".to_string(),
            enabled: true,
        };
        store
            .attach_policies(id, marked.generation, "https://a.com/x.js", vec![policy.clone(), policy])
            .unwrap();

        assert_eq!(
            summarize(&store, id),
            Summary { leak_count: 1, violation_count: 1, policy_match_count: 2 }
        );

        store.reset(id);
        assert_eq!(summarize(&store, id), Summary::default());
    }

    #[test]
    fn test_badge_text() {
        let mut summary = Summary::default();
        assert_eq!(badge_text(&summary), "");
        summary.leak_count = 12;
        assert_eq!(badge_text(&summary), "12");
        summary.leak_count = 1000;
        assert_eq!(badge_text(&summary), "999+");
    }
}
