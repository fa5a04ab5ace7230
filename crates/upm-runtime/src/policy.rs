//! Staged-rollout gate consulted before a non-shadow activation.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use upm_core::{Actor, Role, Snapshot, TrainingMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Authorization collaborator for snapshot promotion.
#[async_trait]
pub trait ActivationPolicy: Send + Sync {
    async fn can_activate(
        &self,
        actor: &Actor,
        snapshot: &Snapshot,
        tenant: Option<&str>,
    ) -> PolicyDecision;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Tenants allowed to receive canary snapshots.
    pub canary_tenants: BTreeSet<String>,
    /// Minimum time in shadow before a snapshot may go active.
    #[serde(with = "crate::serde_duration")]
    pub min_shadow_duration: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            canary_tenants: BTreeSet::new(),
            min_shadow_duration: Duration::from_secs(3600),
        }
    }
}

/// Default policy: shadow is open, canary is allow-listed, active needs
/// validated shadow time, admins bypass every gate.
#[derive(Debug, Clone, Default)]
pub struct StagedRolloutPolicy {
    config: PolicyConfig,
}

impl StagedRolloutPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ActivationPolicy for StagedRolloutPolicy {
    async fn can_activate(
        &self,
        actor: &Actor,
        snapshot: &Snapshot,
        tenant: Option<&str>,
    ) -> PolicyDecision {
        if actor.is_admin() {
            return PolicyDecision::Allow;
        }

        if snapshot.mode != TrainingMode::Shadow && !actor.role.has_permission(Role::Operator) {
            return PolicyDecision::Deny(format!(
                "{} '{}' may not promote {} snapshots",
                actor.role, actor.id, snapshot.mode
            ));
        }

        match snapshot.mode {
            TrainingMode::Shadow => PolicyDecision::Allow,
            TrainingMode::Canary => match tenant {
                Some(t) if self.config.canary_tenants.contains(t) => PolicyDecision::Allow,
                Some(t) => PolicyDecision::Deny(format!("tenant '{}' is not in the canary list", t)),
                None => PolicyDecision::Deny("canary activation requires a tenant".to_string()),
            },
            TrainingMode::Active => {
                let Some(started) = snapshot.shadow_started_at else {
                    return PolicyDecision::Deny(format!(
                        "snapshot {} never entered shadow validation",
                        snapshot.id
                    ));
                };
                let elapsed = (Utc::now() - started).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= self.config.min_shadow_duration {
                    PolicyDecision::Allow
                } else {
                    PolicyDecision::Deny(format!(
                        "snapshot {} has been in shadow for {}s, {}s required",
                        snapshot.id,
                        elapsed.as_secs(),
                        self.config.min_shadow_duration.as_secs()
                    ))
                }
            }
        }
    }
}

/// Approves everything. Used by simulations and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl ActivationPolicy for AllowAllPolicy {
    async fn can_activate(&self, _: &Actor, _: &Snapshot, _: Option<&str>) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use upm_core::{SnapshotMetadata, SnapshotStatus};

    fn snapshot(mode: TrainingMode) -> Snapshot {
        Snapshot {
            id: "s1".into(),
            trainer_id: "t1".into(),
            version: 1,
            mode,
            status: SnapshotStatus::Shadow,
            checksum: String::new(),
            storage_path: String::new(),
            size_bytes: 0,
            metadata: SnapshotMetadata::default(),
            created_at: Utc::now(),
            shadow_started_at: None,
            activated_at: None,
        }
    }

    fn policy() -> StagedRolloutPolicy {
        StagedRolloutPolicy::new(PolicyConfig {
            canary_tenants: ["acme".to_string()].into_iter().collect(),
            min_shadow_duration: Duration::from_secs(600),
        })
    }

    #[tokio::test]
    async fn test_admin_bypasses_gates() {
        let s = snapshot(TrainingMode::Active);
        let d = policy().can_activate(&Actor::admin("root"), &s, None).await;
        assert_eq!(d, PolicyDecision::Allow);
    }

    #[tokio::test]
    async fn test_viewer_denied_outside_shadow() {
        let viewer = Actor::new("v", Role::Viewer);
        let p = policy();
        assert!(!p
            .can_activate(&viewer, &snapshot(TrainingMode::Canary), Some("acme"))
            .await
            .is_allowed());
        assert!(p
            .can_activate(&viewer, &snapshot(TrainingMode::Shadow), None)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn test_canary_requires_listed_tenant() {
        let op = Actor::operator("op");
        let s = snapshot(TrainingMode::Canary);
        let p = policy();
        assert!(p.can_activate(&op, &s, Some("acme")).await.is_allowed());
        assert!(!p.can_activate(&op, &s, Some("globex")).await.is_allowed());
        assert!(!p.can_activate(&op, &s, None).await.is_allowed());
    }

    #[tokio::test]
    async fn test_active_requires_shadow_time() {
        let op = Actor::operator("op");
        let p = policy();

        let never = snapshot(TrainingMode::Active);
        assert!(!p.can_activate(&op, &never, None).await.is_allowed());

        let mut fresh = snapshot(TrainingMode::Active);
        fresh.shadow_started_at = Some(Utc::now() - ChronoDuration::seconds(60));
        assert!(!p.can_activate(&op, &fresh, None).await.is_allowed());

        let mut seasoned = snapshot(TrainingMode::Active);
        seasoned.shadow_started_at = Some(Utc::now() - ChronoDuration::seconds(900));
        assert!(p.can_activate(&op, &seasoned, None).await.is_allowed());
    }
}
