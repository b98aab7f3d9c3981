//! Unit tests for maintenance schedules

use chrono::Duration;

use etcd_operator::controller::schedule::{Cadence, Schedules, due_actions};
use etcd_operator::crd::{BackupConfig, Etcd, MaintenanceKind, MaintenanceRecord};

use crate::common::*;

fn schedules_of(etcd: &Etcd) -> Schedules {
    desired_for(etcd).schedules
}

fn with_backup(backup: BackupConfig) -> Etcd {
    EtcdBuilder::new("main", "default").with_backup(backup).build()
}

fn consumed(kind: MaintenanceKind, secs: i64) -> MaintenanceRecord {
    MaintenanceRecord {
        last_scheduled: Some(at(secs)),
        ..MaintenanceRecord::new(kind)
    }
}

mod resolution_tests {
    use super::*;

    #[test]
    fn test_no_backup_no_schedules() {
        let schedules = schedules_of(&create_test_etcd("main", "default", 3));
        assert!(!schedules.any_configured());
        assert!(schedules.invalid().is_empty());
    }

    #[test]
    fn test_defragmentation_without_backup() {
        let etcd = EtcdBuilder::new("main", "default")
            .with_defragmentation("0 3 * * *")
            .build();
        let schedules = schedules_of(&etcd);
        assert!(schedules.any_configured());
        assert!(matches!(
            schedules.cadence(MaintenanceKind::Defragmentation),
            Cadence::Cron(_)
        ));
        assert_eq!(
            schedules.cadence(MaintenanceKind::FullSnapshot),
            &Cadence::Disabled
        );
    }

    #[test]
    fn test_backup_periods() {
        let schedules = schedules_of(&with_backup(BackupConfig {
            full_snapshot_schedule: Some("0 */6 * * *".to_string()),
            delta_snapshot_period_seconds: Some(300),
            garbage_collection_period_seconds: Some(3600),
            delta_snapshot_memory_limit: Some(100 * 1024 * 1024),
            ..backup_config()
        }));

        assert_eq!(
            schedules.cadence(MaintenanceKind::DeltaSnapshot),
            &Cadence::Every(Duration::seconds(300))
        );
        assert_eq!(
            schedules.cadence(MaintenanceKind::GarbageCollection),
            &Cadence::Every(Duration::seconds(3600))
        );
        assert_eq!(schedules.delta_memory_limit, Some(100 * 1024 * 1024));
        assert!(schedules.invalid().is_empty());
    }

    #[test]
    fn test_full_schedule_requires_delta_period() {
        let schedules = schedules_of(&with_backup(BackupConfig {
            full_snapshot_schedule: Some("0 */6 * * *".to_string()),
            ..backup_config()
        }));
        let invalid = schedules.invalid();
        assert_eq!(invalid.len(), 1);
        assert!(invalid.contains_key(&MaintenanceKind::DeltaSnapshot));
    }

    #[test]
    fn test_backup_with_store_only_counts_as_unscheduled() {
        let schedules = schedules_of(&with_backup(backup_config()));
        assert!(!schedules.any_configured());
    }
}

mod due_tests {
    use super::*;

    fn delta_every(period: i64) -> Schedules {
        schedules_of(&EtcdBuilder::new("main", "default").with_delta_snapshots(period).build())
    }

    #[test]
    fn test_not_due_before_first_boundary() {
        let due = due_actions(at(299), &delta_every(300), &[], None, epoch());
        assert!(due.is_empty());
        assert_eq!(due.next_boundary, Some(at(300)));
    }

    #[test]
    fn test_due_at_boundary() {
        let due = due_actions(at(301), &delta_every(300), &[], None, epoch());
        assert_eq!(due.due.get(&MaintenanceKind::DeltaSnapshot), Some(&at(300)));
        assert_eq!(due.next_boundary, Some(at(600)));
    }

    #[test]
    fn test_consumed_boundary_does_not_fire_twice() {
        let history = [consumed(MaintenanceKind::DeltaSnapshot, 300)];
        let due = due_actions(at(450), &delta_every(300), &history, None, epoch());
        assert!(due.is_empty());
        assert_eq!(due.next_boundary, Some(at(600)));
    }

    #[test]
    fn test_outage_fires_once_on_original_cadence() {
        let history = [consumed(MaintenanceKind::DeltaSnapshot, 300)];
        let due = due_actions(at(3010), &delta_every(300), &history, None, epoch());
        assert_eq!(due.due.len(), 1);
        assert_eq!(due.due.get(&MaintenanceKind::DeltaSnapshot), Some(&at(3000)));
        assert_eq!(due.next_boundary, Some(at(3300)));
    }

    #[test]
    fn test_several_kinds_due_together() {
        let schedules = schedules_of(&with_backup(BackupConfig {
            full_snapshot_schedule: Some("0 */6 * * *".to_string()),
            delta_snapshot_period_seconds: Some(300),
            garbage_collection_period_seconds: Some(3600),
            ..backup_config()
        }));
        let due = due_actions(at(6 * 3600 + 5), &schedules, &[], None, epoch());

        assert_eq!(
            due.due.get(&MaintenanceKind::FullSnapshot),
            Some(&at(6 * 3600))
        );
        assert_eq!(
            due.due.get(&MaintenanceKind::DeltaSnapshot),
            Some(&at(6 * 3600))
        );
        assert_eq!(
            due.due.get(&MaintenanceKind::GarbageCollection),
            Some(&at(6 * 3600))
        );
        assert!(!due.due.contains_key(&MaintenanceKind::Defragmentation));
    }

    #[test]
    fn test_anchor_is_creation_time() {
        let etcd = EtcdBuilder::new("main", "default")
            .with_delta_snapshots(300)
            .created_at(at(100))
            .build();
        let desired = desired_for(&etcd);
        assert_eq!(desired.creation_time, at(100));

        let due = due_actions(at(350), &desired.schedules, &[], None, desired.creation_time);
        assert!(due.is_empty());
        assert_eq!(due.next_boundary, Some(at(400)));
    }

    #[test]
    fn test_in_flight_suppresses() {
        let history = [MaintenanceRecord {
            in_flight: Some("main-delta-snapshot-1".to_string()),
            ..consumed(MaintenanceKind::DeltaSnapshot, 300)
        }];
        let due = due_actions(at(610), &delta_every(300), &history, None, epoch());
        assert!(due.is_empty());
        assert_eq!(
            due.suppressed.get(&MaintenanceKind::DeltaSnapshot),
            Some(&at(600))
        );
    }

    #[test]
    fn test_size_trigger() {
        let schedules = schedules_of(&with_backup(BackupConfig {
            delta_snapshot_period_seconds: Some(300),
            delta_snapshot_memory_limit: Some(1024),
            ..backup_config()
        }));
        let history = [consumed(MaintenanceKind::DeltaSnapshot, 300)];

        let due = due_actions(at(400), &schedules, &history, Some(512), epoch());
        assert!(due.is_empty());

        let due = due_actions(at(400), &schedules, &history, Some(4096), epoch());
        assert_eq!(due.due.get(&MaintenanceKind::DeltaSnapshot), Some(&at(400)));
    }

    #[test]
    fn test_invalid_kind_never_due() {
        let schedules = schedules_of(&with_backup(BackupConfig {
            full_snapshot_schedule: Some("0 */6 * * *".to_string()),
            ..backup_config()
        }));
        let due = due_actions(at(7 * 3600), &schedules, &[], None, epoch());
        assert!(!due.due.contains_key(&MaintenanceKind::DeltaSnapshot));
        assert!(due.due.contains_key(&MaintenanceKind::FullSnapshot));
        assert!(due.invalid.contains_key(&MaintenanceKind::DeltaSnapshot));
    }
}
