//! Lease-based election of the single replica that is allowed to write certificates
//!
//! Uses a `coordination.k8s.io/v1` Lease, written with optimistic concurrency on its
//! `resourceVersion`. This guarantees at most one leader per term only as far as the replicas'
//! clocks agree, so everything run under leadership must tolerate a brief overlap.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use stackable_operator::k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
    chrono::{self, DateTime, Utc},
};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    store::{self, ObjectStore},
    watch::sleep_or_cancel,
};

type Result<T, E = store::Error> = std::result::Result<T, E>;

#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    /// Written into the lease as its holder, must be unique per replica.
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

/// Receives the transitions of one leadership term.
#[async_trait]
pub trait LeadershipHandler: Send + Sync {
    /// Called once the lease was acquired. `term` is cancelled when leadership ends.
    async fn started_leading(&self, term: CancellationToken);

    /// Called after `term` has been cancelled, before [`LeaderElector::run`] returns.
    async fn stopped_leading(&self);
}

pub struct LeaderElector {
    leases: Arc<dyn ObjectStore<Lease>>,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(leases: Arc<dyn ObjectStore<Lease>>, config: LeaderElectionConfig) -> Self {
        Self { leases, config }
    }

    /// Waits for the lease, leads until it is lost or `cancel` fires, and returns.
    ///
    /// Returns without ever calling `handler` if `cancel` fires before the lease is acquired.
    /// Every store call is bounded by `renew_deadline`, and the term ends once that much time
    /// has passed since the last successful renewal. On cancellation the lease is released
    /// only after `stopped_leading` has returned.
    ///
    /// Only fatal store errors are returned, anything else is retried every `retry_period`.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        handler: &dyn LeadershipHandler,
    ) -> Result<()> {
        let LeaderElectionConfig {
            lease_name,
            identity,
            retry_period,
            renew_deadline,
            ..
        } = &self.config;

        info!(lease = %lease_name, %identity, "waiting to acquire leader lease");
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                attempt = timeout(*renew_deadline, self.try_acquire_or_renew(Utc::now())) => attempt,
            };
            match attempt {
                Ok(Ok(true)) => break,
                Ok(Ok(false)) => debug!(lease = %lease_name, "lease is held by another replica"),
                Ok(Err(err)) if err.is_fatal() => return Err(err),
                Ok(Err(err)) => warn!(
                    lease = %lease_name,
                    error = &err as &dyn std::error::Error,
                    "failed to acquire lease, retrying"
                ),
                Err(_) => warn!(
                    lease = %lease_name,
                    timeout = ?renew_deadline,
                    "acquiring lease timed out, retrying"
                ),
            }
            if sleep_or_cancel(*retry_period, cancel).await {
                return Ok(());
            }
        }

        info!(lease = %lease_name, %identity, "became leader");
        let term = cancel.child_token();
        handler.started_leading(term.clone()).await;

        let mut last_renewal = Instant::now();
        let (result, still_held) = loop {
            if sleep_or_cancel(*retry_period, cancel).await {
                break (Ok(()), true);
            }
            // A hanging API call must not keep the term open past the deadline
            let remaining = renew_deadline.saturating_sub(last_renewal.elapsed());
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break (Ok(()), true),
                attempt = timeout(remaining, self.try_acquire_or_renew(Utc::now())) => attempt,
            };
            match attempt {
                Ok(Ok(true)) => {
                    last_renewal = Instant::now();
                    continue;
                }
                Ok(Ok(false)) => {
                    warn!(lease = %lease_name, "lease was taken over by another replica");
                    break (Ok(()), false);
                }
                Ok(Err(err)) if err.is_fatal() => break (Err(err), false),
                Ok(Err(err)) => warn!(
                    lease = %lease_name,
                    error = &err as &dyn std::error::Error,
                    "failed to renew lease"
                ),
                Err(_) => {}
            }
            if last_renewal.elapsed() >= *renew_deadline {
                warn!(
                    lease = %lease_name,
                    renew_deadline = ?renew_deadline,
                    "could not renew lease in time, stepping down"
                );
                break (Ok(()), false);
            }
        };

        term.cancel();
        // Wait for the term's work to wind down before another replica may take over
        handler.stopped_leading().await;
        if still_held && timeout(*renew_deadline, self.release()).await.is_err() {
            warn!(lease = %lease_name, "releasing lease timed out");
        }
        info!(lease = %lease_name, %identity, "stopped leading");
        result
    }

    /// Makes one attempt at holding the lease, returning whether we hold it afterwards.
    ///
    /// Losing a write race to another replica is reported as `Ok(false)`.
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool> {
        match self.write_lease(now).await {
            Err(err) if err.is_conflict() => Ok(false),
            res => res,
        }
    }

    async fn write_lease(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(lease) = self.leases.get_opt(&self.config.lease_name).await? else {
            self.leases.create(&self.new_lease(now)).await?;
            return Ok(true);
        };
        let spec = lease.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.config.identity.as_str());
        if !held_by_us && !is_vacant(&spec, now) {
            return Ok(false);
        }
        self.leases
            .replace(&self.renewed_lease(lease, spec, now, !held_by_us))
            .await?;
        Ok(true)
    }

    /// Clears the holder, so that another replica does not have to wait for the lease to expire.
    async fn release(&self) {
        let lease_name = &self.config.lease_name;
        let lease = match self.leases.get_opt(lease_name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(err) => {
                warn!(
                    lease = %lease_name,
                    error = &err as &dyn std::error::Error,
                    "failed to read lease for release"
                );
                return;
            }
        };
        let mut spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            debug!(lease = %lease_name, "lease is not ours, skipping release");
            return;
        }
        spec.holder_identity = None;
        match self.leases.replace(&Lease { spec: Some(spec), ..lease }).await {
            Ok(_) => info!(lease = %lease_name, "released leader lease"),
            Err(err) => warn!(
                lease = %lease_name,
                error = &err as &dyn std::error::Error,
                "failed to release lease"
            ),
        }
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn new_lease(&self, now: DateTime<Utc>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.config.lease_name.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.config.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration_seconds()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..LeaseSpec::default()
            }),
        }
    }

    fn renewed_lease(
        &self,
        lease: Lease,
        mut spec: LeaseSpec,
        now: DateTime<Utc>,
        takeover: bool,
    ) -> Lease {
        if takeover {
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.holder_identity = Some(self.config.identity.clone());
        spec.lease_duration_seconds = Some(self.lease_duration_seconds());
        spec.renew_time = Some(MicroTime(now));
        Lease {
            spec: Some(spec),
            ..lease
        }
    }
}

/// Whether nobody holds the lease, or its holder failed to renew it in time.
fn is_vacant(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    if spec.holder_identity.as_deref().unwrap_or_default().is_empty() {
        return true;
    }
    match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(MicroTime(renewed)), Some(duration)) => {
            *renewed + chrono::Duration::seconds(i64::from(duration)) < now
        }
        _ => true,
    }
}
