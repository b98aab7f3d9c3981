//! Reconciliation logic for Etcd resources
//!
//! A pass reads the desired and observed state, applies at most one
//! structural change to the member set, supervises maintenance and writes
//! the recomputed status. Every pass starts from a fresh observation, so an
//! interrupted pass is finished by the next one.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::desired::DesiredState;
use crate::controller::error::{Error, Result};
use crate::controller::maintenance::{MaintenanceReport, run_maintenance};
use crate::controller::membership::initial_cluster;
use crate::controller::members::{ConvergenceAction, next_rollout};
use crate::controller::observed::ObservedState;
use crate::controller::platform::{WorkloadWrite, has_finalizer};
use crate::controller::retention::{
    RemovedMember, all_members, claims_to_delete, orphaned_members, removed_members,
};
use crate::controller::status::{PassOutcome, needs_write};
use crate::crd::{Etcd, EtcdStatus};
use crate::resources::common::claim_ordinal;
use crate::resources::configmap::InitialCluster;
use crate::resources::statefulset::generate_statefulset;

/// Requeue interval while a convergence step is in progress
const PROGRESS_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue interval while maintenance tasks are running
const MAINTENANCE_REQUEUE: Duration = Duration::from_secs(30);

/// Main reconciliation function
pub async fn reconcile(etcd: Arc<Etcd>, ctx: Arc<Context>) -> Result<Action> {
    reconcile_at(&etcd, &ctx, Utc::now()).await
}

/// Run one pass as of `now`
#[instrument(skip(etcd, ctx, now), fields(name = %etcd.name_any(), namespace = etcd.namespace().unwrap_or_default()))]
pub async fn reconcile_at(etcd: &Etcd, ctx: &Context, now: DateTime<Utc>) -> Result<Action> {
    let ns = etcd.namespace().unwrap_or_default();
    let name = etcd.name_any();
    let started = Instant::now();

    info!("Reconciling Etcd");

    let result = if etcd.metadata.deletion_timestamp.is_some() {
        teardown(etcd, ctx, now).await
    } else {
        reconcile_cluster(etcd, ctx, now).await
    };

    if let Some(state) = &ctx.health_state {
        state.metrics.record_reconcile(
            &ns,
            &name,
            started.elapsed().as_secs_f64(),
            now.timestamp(),
        );
        if let Err(e) = &result {
            state.metrics.record_error(&ns, &name, e.kind());
        }
    }

    match &result {
        Ok(action) => {
            ctx.reset_failures(&object_key(etcd));
            debug!(?action, "Reconciliation completed");
        }
        Err(e) => error!("Reconciliation failed: {}", e),
    }

    result
}

/// Error policy for the controller with exponential backoff
///
/// Errors that need a spec correction wait for the next change instead of
/// retrying.
pub fn error_policy(etcd: Arc<Etcd>, error: &Error, ctx: Arc<Context>) -> Action {
    let attempt = ctx.record_failure(&object_key(&etcd));

    match ctx.backoff.delay_for_error(error, attempt) {
        Some(delay) => {
            warn!(
                name = %etcd.name_any(),
                error = %error,
                kind = error.kind(),
                attempt = attempt + 1,
                requeue_secs = delay.as_secs_f64(),
                "Pass failed, retrying"
            );
            Action::requeue(delay)
        }
        None => {
            error!(
                name = %etcd.name_any(),
                error = %error,
                kind = error.kind(),
                "Pass failed, waiting for a spec change"
            );
            Action::await_change()
        }
    }
}

fn object_key(etcd: &Etcd) -> String {
    format!("{}/{}", etcd.namespace().unwrap_or_default(), etcd.name_any())
}

async fn reconcile_cluster(etcd: &Etcd, ctx: &Context, now: DateTime<Utc>) -> Result<Action> {
    let platform = ctx.platform.as_ref();
    let previous = etcd.status.clone().unwrap_or_default();
    let generation = etcd.metadata.generation.unwrap_or_default();

    if !has_finalizer(etcd) {
        platform.add_finalizer(etcd).await?;
    }

    let desired = match DesiredState::from_resource(etcd, &ctx.config) {
        Ok(desired) => desired,
        Err(e) => {
            warn!(error = %e, "spec cannot be realised");
            let status = ctx.status.record_failure(&previous, generation, &e, now);
            write_status(etcd, ctx, &status, now).await?;
            return Err(e);
        }
    };

    let observed = platform.observe(etcd).await?;
    let cluster = initial_cluster(&observed, previous.cluster_id.as_deref());
    platform.apply_member_config(etcd, &cluster).await?;
    platform.apply_ancillary(etcd).await?;

    let (action, mut failure) =
        match ctx
            .members
            .plan(&desired, &observed, previous.rollout.as_ref(), now)
        {
            Ok(action) => (Some(action), None),
            Err(e) => {
                warn!(error = %e, "convergence step refused");
                (None, Some(e))
            }
        };

    let mut retained: BTreeSet<String> = previous.retained_claims.iter().cloned().collect();
    if let Some(action) = &action {
        debug!(%action, "planned convergence step");
        if let Err(e) = apply_action(etcd, ctx, &desired, &observed, &previous, action, &mut retained).await {
            warn!(error = %e, action = action.label(), "convergence step failed");
            failure = Some(e);
        }
    }

    // Claims of members that are back in the workload are in use again
    let voting = match &action {
        Some(ConvergenceAction::ScaleDown { to, .. }) => (*to).min(observed.workload_replicas()),
        _ => observed.workload_replicas(),
    };
    retained.retain(|claim| claim_ordinal(&desired.name, claim).is_none_or(|o| o >= voting));

    let rollout = match &action {
        Some(action) if failure.is_none() => {
            next_rollout(previous.rollout.as_ref(), action, observed.workload.as_ref(), now)
        }
        _ => previous.rollout.clone(),
    };

    let structural = action.as_ref().is_some_and(ConvergenceAction::is_structural);
    let allowed = failure.is_none() && !structural && observed.healthy() > 0;
    let report = run_maintenance(
        platform,
        etcd,
        &desired,
        &observed,
        &previous.maintenance,
        allowed,
        now,
    )
    .await;

    if let Some(state) = &ctx.health_state {
        state.metrics.set_members(
            &desired.namespace,
            &desired.name,
            i64::from(desired.replicas),
            i64::from(observed.healthy()),
        );
        for (kind, _) in &report.triggered {
            state.metrics.record_maintenance(*kind);
        }
    }

    let outcome = PassOutcome {
        action: action.as_ref(),
        error: failure.as_ref(),
        maintenance: Some(&report),
        rollout,
        retained_claims: retained.into_iter().collect(),
    };
    let status = ctx
        .status
        .recompute(&previous, &desired, &observed, &outcome, now);

    if let Err(e) = write_status(etcd, ctx, &status, now).await {
        warn!(error = %e, "failed to write status");
        if failure.is_none() {
            return Err(e);
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }

    let action = action.unwrap_or(ConvergenceAction::NoOp);
    Ok(Action::requeue(requeue_after(
        &action,
        &report,
        ctx.config.resync_interval,
        now,
    )))
}

/// Apply the single structural change of a pass, or sweep orphaned claims
/// when the pass makes none
async fn apply_action(
    etcd: &Etcd,
    ctx: &Context,
    desired: &DesiredState,
    observed: &ObservedState,
    previous: &EtcdStatus,
    action: &ConvergenceAction,
    retained: &mut BTreeSet<String>,
) -> Result<()> {
    let platform = ctx.platform.as_ref();
    let resource_version = observed
        .workload
        .as_ref()
        .and_then(|w| w.resource_version.clone());
    let master = observed.leader.or_else(|| previous.last_known_leader());

    match action {
        ConvergenceAction::Create { replicas } => {
            let statefulset = generate_statefulset(etcd, desired, *replicas, 0);
            platform
                .apply_workload(etcd, WorkloadWrite::Create(Box::new(statefulset)))
                .await
        }
        ConvergenceAction::ScaleUp { to, .. } => {
            // The joining member must be known to the cluster before it starts
            let joining = to - 1;
            let registered = observed
                .membership
                .as_ref()
                .is_some_and(|m| m.is_registered(joining));
            if !registered {
                platform.add_learner(etcd, joining).await?;
            }
            platform
                .apply_member_config(etcd, &InitialCluster::existing(*to))
                .await?;
            platform
                .apply_workload(
                    etcd,
                    WorkloadWrite::Scale {
                        replicas: *to,
                        resource_version,
                    },
                )
                .await
        }
        ConvergenceAction::ScaleDown { to, removing, .. } => {
            // Unregistered first so quorum never counts a stopped member
            for ordinal in removing {
                platform.remove_member(etcd, *ordinal).await?;
            }
            platform
                .apply_workload(
                    etcd,
                    WorkloadWrite::Scale {
                        replicas: *to,
                        resource_version,
                    },
                )
                .await?;

            let removed = removed_members(observed, removing);
            let doomed = claims_to_delete(desired.retention, &removed, master);
            for claim in removed.iter().flat_map(|m| m.claims.iter()) {
                if !doomed.contains(claim) {
                    retained.insert(claim.clone());
                }
            }
            info!(
                policy = %desired.retention,
                deleting = doomed.len(),
                "removed members {:?}",
                removing
            );
            delete_claims(ctx, &desired.namespace, doomed).await
        }
        ConvergenceAction::UpdateSpec { fields, partition } if !fields.is_empty() => {
            let replicas = observed.workload_replicas();
            let statefulset = generate_statefulset(etcd, desired, replicas, *partition);
            info!(?fields, partition, "rolling out member template");
            platform
                .apply_workload(
                    etcd,
                    WorkloadWrite::Template {
                        statefulset: Box::new(statefulset),
                        resource_version,
                    },
                )
                .await
        }
        ConvergenceAction::UpdateSpec { partition, .. } => {
            platform
                .apply_workload(
                    etcd,
                    WorkloadWrite::Partition {
                        partition: *partition,
                        resource_version,
                    },
                )
                .await
        }
        ConvergenceAction::PromoteLearner { ordinal } => {
            platform.promote_member(etcd, *ordinal).await
        }
        ConvergenceAction::RemoveStale { ordinals } => {
            for ordinal in ordinals {
                platform.remove_member(etcd, *ordinal).await?;
            }
            info!("unregistered members {:?} left outside the workload", ordinals);
            Ok(())
        }
        ConvergenceAction::Delete => Ok(()),
        ConvergenceAction::NoOp | ConvergenceAction::Wait { .. } => {
            let orphans: Vec<RemovedMember> = orphaned_members(observed)
                .into_iter()
                .map(|member| RemovedMember {
                    claims: member
                        .claims
                        .into_iter()
                        .filter(|c| !retained.contains(c))
                        .collect(),
                    ..member
                })
                .collect();
            let doomed = claims_to_delete(desired.retention, &orphans, master);
            if !doomed.is_empty() {
                info!(claims = doomed.len(), "deleting claims left by an interrupted removal");
            }
            delete_claims(ctx, &desired.namespace, doomed).await
        }
    }
}

async fn delete_claims(ctx: &Context, namespace: &str, claims: BTreeSet<String>) -> Result<()> {
    if claims.is_empty() {
        return Ok(());
    }
    let claims: Vec<String> = claims.into_iter().collect();
    ctx.platform.delete_claims(namespace, &claims).await
}

/// Tear the cluster down and release the finalizer
///
/// The workload goes first; claims follow the retention policy with the
/// master taken from the live leader or, when no member reports one, the
/// last leader recorded in status.
async fn teardown(etcd: &Etcd, ctx: &Context, now: DateTime<Utc>) -> Result<Action> {
    if !has_finalizer(etcd) {
        return Ok(Action::await_change());
    }

    let platform = ctx.platform.as_ref();
    let ns = etcd
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = etcd.name_any();
    let previous = etcd.status.clone().unwrap_or_default();

    info!("Tearing down etcd cluster");

    let status = ctx.status.record_deletion(&previous, now);
    write_status(etcd, ctx, &status, now).await?;

    let observed = platform.observe(etcd).await?;
    let master = observed.leader.or_else(|| previous.last_known_leader());
    let doomed = claims_to_delete(
        etcd.spec.pvc_retention_policy,
        &all_members(&observed),
        master,
    );

    platform.delete_workload(&ns, &name).await?;
    let deleted = doomed.len();
    delete_claims(ctx, &ns, doomed).await?;
    platform.remove_finalizer(etcd).await?;

    if let Some(state) = &ctx.health_state {
        state.metrics.forget_cluster(&ns, &name);
    }

    info!(
        policy = %etcd.spec.pvc_retention_policy,
        claims_deleted = deleted,
        "Cluster torn down"
    );
    Ok(Action::await_change())
}

async fn write_status(
    etcd: &Etcd,
    ctx: &Context,
    status: &EtcdStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    if !needs_write(etcd.status.as_ref(), status, now, ctx.config.resync_interval) {
        debug!("status unchanged, skipping write");
        return Ok(());
    }
    ctx.platform.write_status(etcd, status).await
}

/// How long until the next pass
///
/// Converged clusters resync on the configured interval, clusters in motion
/// come back sooner. A pending schedule boundary shortens either.
pub fn requeue_after(
    action: &ConvergenceAction,
    report: &MaintenanceReport,
    resync: Duration,
    now: DateTime<Utc>,
) -> Duration {
    let base = match action {
        ConvergenceAction::NoOp if report.in_flight() => MAINTENANCE_REQUEUE.min(resync),
        ConvergenceAction::NoOp => resync,
        _ => PROGRESS_REQUEUE,
    };

    match report.next_boundary {
        Some(at) => {
            let until = (at - now).to_std().unwrap_or(Duration::ZERO);
            base.min(until.max(Duration::from_secs(1)))
        }
        None => base,
    }
}
