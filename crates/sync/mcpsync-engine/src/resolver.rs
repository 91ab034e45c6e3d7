//! Conflict resolution planning
//!
//! The resolver decides what a resolution means for the data. Executing the
//! plan (pushing, committing, closing the conflict) is the engine's job, so a
//! failed push never leaves a conflict marked resolved.

use crate::conflicts::ConflictRecord;
use crate::error::{EngineError, Result};
use crate::settings::ResolutionPolicy;
use crate::types::{EntityPayload, Replica, Resolution, SyncStatus};
use crate::version::Version;
use std::cmp::Ordering;

/// Data movement implied by a resolution
#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction {
    /// Write `payload` to the remote, then commit it locally at the version
    /// the remote reports
    Push {
        payload: EntityPayload,
        proposed_version: Version,
    },
    /// Overwrite the local side with the remote replica
    Pull { replica: Replica },
    /// No data change
    Leave,
}

/// A resolution and the action that carries it out
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    pub resolution: Resolution,
    pub action: MergeAction,
}

/// Turns resolution decisions into merge actions
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolution a policy picks for a conflict; `None` under `manual`.
    ///
    /// `newest_wins` refuses to guess when both sides carry the same
    /// timestamp.
    pub fn decide(&self, policy: ResolutionPolicy, record: &ConflictRecord) -> Result<Option<Resolution>> {
        match policy {
            ResolutionPolicy::Manual => Ok(None),
            ResolutionPolicy::LocalWins => Ok(Some(Resolution::LocalWins)),
            ResolutionPolicy::RemoteWins => Ok(Some(Resolution::RemoteWins)),
            ResolutionPolicy::NewestWins => match record.local.timestamp.cmp(&record.remote.timestamp) {
                Ordering::Greater => Ok(Some(Resolution::LocalWins)),
                Ordering::Less => Ok(Some(Resolution::RemoteWins)),
                Ordering::Equal => Err(EngineError::AmbiguousResolution {
                    entity_id: record.conflict.entity_id.clone(),
                }),
            },
        }
    }

    pub fn plan(
        &self,
        record: &ConflictRecord,
        resolution: Resolution,
        merged: Option<EntityPayload>,
    ) -> Result<ResolutionPlan> {
        if record.conflict.is_resolved() {
            return Err(EngineError::InvalidTransition(format!(
                "conflict {} is already resolved",
                record.conflict.id
            )));
        }

        let superseding = Version::max_of(&record.local.version, &record.remote.version).next();
        let action = match resolution {
            Resolution::LocalWins => MergeAction::Push {
                payload: record.local.payload.clone(),
                proposed_version: superseding,
            },
            Resolution::RemoteWins => MergeAction::Pull {
                replica: record.remote.clone(),
            },
            Resolution::ManualMerge => MergeAction::Push {
                payload: merged.ok_or(EngineError::MissingMergedPayload(record.conflict.id))?,
                proposed_version: superseding,
            },
            Resolution::Skip => MergeAction::Leave,
        };

        Ok(ResolutionPlan { resolution, action })
    }
}

/// Directional status implied by version order alone.
///
/// Used when no payload comparison is available or wanted: after a skipped
/// conflict and after a restore. Equal versions count as synced only when
/// `payloads_equal` holds; otherwise the local side is treated as ahead.
pub fn status_from_versions(local: &Version, remote: Option<&Version>, payloads_equal: bool) -> SyncStatus {
    match remote {
        None => SyncStatus::LocalNewer,
        Some(remote) => match local.cmp(remote) {
            Ordering::Greater => SyncStatus::LocalNewer,
            Ordering::Less => SyncStatus::RemoteNewer,
            Ordering::Equal if payloads_equal => SyncStatus::Synced,
            Ordering::Equal => SyncStatus::LocalNewer,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Conflict, ConflictType, EntityType};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn record(local_ts: i64, remote_ts: i64) -> ConflictRecord {
        ConflictRecord {
            conflict: Conflict {
                id: Uuid::new_v4(),
                entity_id: "a1".into(),
                entity_name: "Planner".into(),
                entity_type: EntityType::Agent,
                conflict_type: ConflictType::Content,
                conflict_fields: Vec::new(),
                created_at: Utc::now(),
                resolved_at: None,
                resolution: None,
                resolved_by: None,
            },
            local: Replica::new(
                3,
                Utc.timestamp_opt(local_ts, 0).unwrap(),
                EntityPayload::new().with("goal", "local"),
            ),
            remote: Replica::new(
                3,
                Utc.timestamp_opt(remote_ts, 0).unwrap(),
                EntityPayload::new().with("goal", "remote"),
            ),
            server_id: "s1".into(),
            sequence: 0,
        }
    }

    #[test]
    fn test_newest_wins_picks_later_timestamp() {
        let resolver = ConflictResolver::new();
        assert_eq!(
            resolver.decide(ResolutionPolicy::NewestWins, &record(200, 100)).unwrap(),
            Some(Resolution::LocalWins)
        );
        assert_eq!(
            resolver.decide(ResolutionPolicy::NewestWins, &record(100, 200)).unwrap(),
            Some(Resolution::RemoteWins)
        );
        assert_eq!(resolver.decide(ResolutionPolicy::Manual, &record(1, 2)).unwrap(), None);
    }

    #[test]
    fn test_newest_wins_tie_is_ambiguous() {
        let err = ConflictResolver::new()
            .decide(ResolutionPolicy::NewestWins, &record(100, 100))
            .unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousResolution { .. }));
    }

    #[test]
    fn test_plans() {
        let resolver = ConflictResolver::new();
        let rec = record(1, 2);

        match resolver.plan(&rec, Resolution::LocalWins, None).unwrap().action {
            MergeAction::Push { payload, proposed_version } => {
                assert_eq!(payload.get("goal").unwrap(), "local");
                assert_eq!(proposed_version, Version::counter(4));
            }
            other => panic!("unexpected action {:?}", other),
        }

        assert!(matches!(
            resolver.plan(&rec, Resolution::RemoteWins, None).unwrap().action,
            MergeAction::Pull { .. }
        ));
        assert!(matches!(
            resolver.plan(&rec, Resolution::ManualMerge, None),
            Err(EngineError::MissingMergedPayload(_))
        ));
        assert_eq!(
            resolver.plan(&rec, Resolution::Skip, None).unwrap().action,
            MergeAction::Leave
        );
    }

    #[test]
    fn test_plan_rejects_resolved_conflict() {
        let mut rec = record(1, 2);
        rec.conflict.resolved_at = Some(Utc::now());
        assert!(matches!(
            ConflictResolver::new().plan(&rec, Resolution::Skip, None),
            Err(EngineError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_status_from_versions() {
        let v2 = Version::counter(2);
        let v3 = Version::counter(3);
        assert_eq!(status_from_versions(&v3, Some(&v2), false), SyncStatus::LocalNewer);
        assert_eq!(status_from_versions(&v2, Some(&v3), false), SyncStatus::RemoteNewer);
        assert_eq!(status_from_versions(&v3, Some(&v3), true), SyncStatus::Synced);
        assert_eq!(status_from_versions(&v3, None, true), SyncStatus::LocalNewer);
    }
}
