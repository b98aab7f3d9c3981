//! Maintenance scheduling
//!
//! Decides which maintenance kinds are due at a given instant. Each kind has
//! its own cadence, either a cron expression or a fixed period. A kind is due
//! when `now` has crossed a boundary of its cadence since the last boundary
//! consumed for it. Boundaries are consumed even when the kind is suppressed
//! because its previous task is still running, so an outage never turns into
//! a burst of catch-up runs and the next occurrence always stays on the
//! original cadence.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::controller::validation::parse_cron;
use crate::crd::{MaintenanceKind, MaintenanceRecord};

/// Upper bound on cron occurrences walked in one pass
const MAX_OCCURRENCES: usize = 10_000;

/// When a maintenance kind runs
#[derive(Clone, Debug)]
pub enum Cadence {
    Cron(Box<cron::Schedule>),
    Every(Duration),
    /// Not configured
    Disabled,
    /// Configured but unusable; the kind is never due
    Invalid(String),
}

impl PartialEq for Cadence {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cadence::Cron(a), Cadence::Cron(b)) => a.to_string() == b.to_string(),
            (Cadence::Every(a), Cadence::Every(b)) => a == b,
            (Cadence::Disabled, Cadence::Disabled) => true,
            (Cadence::Invalid(a), Cadence::Invalid(b)) => a == b,
            _ => false,
        }
    }
}

impl Cadence {
    pub fn from_cron(expr: Option<&str>) -> Self {
        match expr {
            None => Cadence::Disabled,
            Some(expr) => match parse_cron(expr) {
                Ok(schedule) => Cadence::Cron(Box::new(schedule)),
                Err(e) => Cadence::Invalid(e),
            },
        }
    }

    pub fn from_period(seconds: Option<i64>) -> Self {
        match seconds {
            None | Some(0) => Cadence::Disabled,
            Some(s) if s > 0 => Cadence::Every(Duration::seconds(s)),
            Some(s) => Cadence::Invalid(format!("period must be positive, got {}s", s)),
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Cadence::Invalid(_))
    }

    /// First boundary strictly after `t`
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Cron(schedule) => schedule.after(&t).next(),
            Cadence::Every(period) => t.checked_add_signed(*period),
            Cadence::Disabled | Cadence::Invalid(_) => None,
        }
    }

    /// Latest boundary in `(base, now]`
    pub fn latest_boundary(
        &self,
        base: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if now <= base {
            return None;
        }

        match self {
            Cadence::Every(period) => {
                let period_ms = period.num_milliseconds();
                if period_ms <= 0 {
                    return None;
                }
                let elapsed = (now - base).num_milliseconds();
                let steps = elapsed / period_ms;
                if steps == 0 {
                    return None;
                }
                base.checked_add_signed(Duration::milliseconds(steps.saturating_mul(period_ms)))
            }
            Cadence::Cron(schedule) => {
                let mut cursor = base;
                let mut latest = None;
                loop {
                    let mut walked = 0;
                    for occurrence in schedule.after(&cursor).take(MAX_OCCURRENCES) {
                        if occurrence > now {
                            return latest;
                        }
                        latest = Some(occurrence);
                        walked += 1;
                    }
                    if walked < MAX_OCCURRENCES {
                        return latest;
                    }
                    // Dense schedule after a long gap: only the most recent day matters
                    let skip_to = now - Duration::days(1);
                    cursor = match latest {
                        Some(last) if last > skip_to => last,
                        _ => skip_to,
                    };
                }
            }
            Cadence::Disabled | Cadence::Invalid(_) => None,
        }
    }
}

/// Cadences of every maintenance kind plus the size trigger
#[derive(Clone, Debug, PartialEq)]
pub struct Schedules {
    pub cadences: BTreeMap<MaintenanceKind, Cadence>,
    /// Write volume (bytes) that triggers a delta snapshot early
    pub delta_memory_limit: Option<u64>,
}

impl Schedules {
    /// Nothing scheduled
    pub fn disabled() -> Self {
        Self {
            cadences: MaintenanceKind::ALL
                .into_iter()
                .map(|kind| (kind, Cadence::Disabled))
                .collect(),
            delta_memory_limit: None,
        }
    }

    pub fn cadence(&self, kind: MaintenanceKind) -> &Cadence {
        self.cadences.get(&kind).unwrap_or(&Cadence::Disabled)
    }

    /// Kinds whose configuration cannot be evaluated, with the reason
    pub fn invalid(&self) -> BTreeMap<MaintenanceKind, String> {
        self.cadences
            .iter()
            .filter_map(|(kind, cadence)| match cadence {
                Cadence::Invalid(reason) => Some((*kind, reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn any_configured(&self) -> bool {
        self.cadences
            .values()
            .any(|c| !matches!(c, Cadence::Disabled))
            || self.delta_memory_limit.is_some()
    }
}

/// Result of one schedule evaluation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DueSet {
    /// Kinds to trigger now, with the boundary being consumed
    pub due: BTreeMap<MaintenanceKind, DateTime<Utc>>,
    /// Kinds whose boundary passed while a previous task is still running
    pub suppressed: BTreeMap<MaintenanceKind, DateTime<Utc>>,
    pub invalid: BTreeMap<MaintenanceKind, String>,
    /// Earliest future boundary across all kinds
    pub next_boundary: Option<DateTime<Utc>>,
}

impl DueSet {
    /// Boundaries to record as consumed, due or suppressed
    pub fn consumed(&self) -> impl Iterator<Item = (MaintenanceKind, DateTime<Utc>)> + '_ {
        self.due
            .iter()
            .chain(self.suppressed.iter())
            .map(|(kind, at)| (*kind, *at))
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}

/// Decide which maintenance kinds are due at `now`
///
/// `anchor` is where schedules start counting for kinds that have no history,
/// normally the creation time of the cluster. The function is pure; callers
/// record consumed boundaries into the history they pass next time.
pub fn due_actions(
    now: DateTime<Utc>,
    schedules: &Schedules,
    history: &[MaintenanceRecord],
    delta_bytes: Option<u64>,
    anchor: DateTime<Utc>,
) -> DueSet {
    let mut result = DueSet {
        invalid: schedules.invalid(),
        ..Default::default()
    };

    for kind in MaintenanceKind::ALL {
        let cadence = schedules.cadence(kind);
        if cadence.is_invalid() {
            continue;
        }

        let record = history.iter().find(|r| r.kind == kind);
        let in_flight = record.is_some_and(|r| r.in_flight.is_some());
        let base = record.and_then(|r| r.last_scheduled).unwrap_or(anchor);

        let boundary = cadence.latest_boundary(base, now);
        match boundary {
            Some(at) if in_flight => {
                result.suppressed.insert(kind, at);
            }
            Some(at) => {
                result.due.insert(kind, at);
            }
            None => {}
        }

        if let Some(next) = cadence.next_after(boundary.unwrap_or(base)) {
            result.next_boundary = Some(match result.next_boundary {
                Some(current) => current.min(next),
                None => next,
            });
        }
    }

    // Size trigger layered over the delta cadence
    if let (Some(limit), Some(bytes)) = (schedules.delta_memory_limit, delta_bytes) {
        let kind = MaintenanceKind::DeltaSnapshot;
        let in_flight = history
            .iter()
            .any(|r| r.kind == kind && r.in_flight.is_some());
        if bytes > limit
            && !in_flight
            && !schedules.cadence(kind).is_invalid()
            && !result.due.contains_key(&kind)
        {
            result.due.insert(kind, now);
        }
    }

    result
}
