//! Lease based leader election
//!
//! With several replicas only the holder of a coordination Lease drains the
//! work queue. The holder renews the lease every `renew_interval`; a lease
//! not renewed for `lease_duration` may be taken over by any replica.
//! Admission is served by every replica regardless.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Lease settings
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    /// Unique per replica, usually the pod name
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
}

impl LeaseConfig {
    pub fn new(namespace: &str, identity: &str) -> Self {
        Self {
            name: "pool-cluster-operator-lock".to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Configuration(
                "leader election needs a namespace for its lease".into(),
            ));
        }
        if self.identity.is_empty() {
            return Err(Error::Configuration(
                "leader election needs a replica identity".into(),
            ));
        }
        if self.renew_interval >= self.lease_duration {
            return Err(Error::Configuration(
                "lease renew interval must be shorter than the lease duration".into(),
            ));
        }
        Ok(())
    }
}

/// What a replica may do with the lease it observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseClaim {
    /// No lease object yet
    Create,
    /// Lease is free or expired
    Acquire,
    /// Lease is ours
    Renew,
    /// Someone else holds a live lease
    Held { holder: String },
}

/// Decide on the lease `spec` as seen at `now`. The object is missing when
/// `exists` is false.
pub fn decide(
    exists: bool,
    spec: Option<&LeaseSpec>,
    identity: &str,
    now: DateTime<Utc>,
    default_duration: Duration,
) -> LeaseClaim {
    if !exists {
        return LeaseClaim::Create;
    }
    let Some(spec) = spec else {
        return LeaseClaim::Acquire;
    };
    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() {
        return LeaseClaim::Acquire;
    }
    if holder == identity {
        return LeaseClaim::Renew;
    }

    let duration = spec
        .lease_duration_seconds
        .and_then(|s| u64::try_from(s).ok())
        .map(Duration::from_secs)
        .unwrap_or(default_duration);
    let last = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    let expired = match (last, chrono::Duration::from_std(duration)) {
        (Some(last), Ok(duration)) => last + duration < now,
        _ => true,
    };
    if expired {
        LeaseClaim::Acquire
    } else {
        LeaseClaim::Held {
            holder: holder.to_string(),
        }
    }
}

/// Campaigns for the lease and publishes whether this replica leads
pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaseConfig,
}

impl LeaderElector {
    pub fn new(client: kube::Client, config: LeaseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            api: Api::namespaced(client, &config.namespace),
            config,
        })
    }

    /// One acquire-or-renew round. Returns whether this replica leads.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let existing = self.api.get_opt(&self.config.name).await?;
        let claim = decide(
            existing.is_some(),
            existing.as_ref().and_then(|l| l.spec.as_ref()),
            &self.config.identity,
            now,
            self.config.lease_duration,
        );

        match &claim {
            LeaseClaim::Held { holder } => {
                debug!(holder = %holder, "Lease held by another replica");
                return Ok(false);
            }
            LeaseClaim::Create => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.config.name.clone()),
                        namespace: Some(self.config.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.spec_for(None, now, true)),
                };
                let won = self.write(self.api.create(&PostParams::default(), &lease).await)?;
                if won {
                    info!(identity = %self.config.identity, "Created lease and became leader");
                }
                return Ok(won);
            }
            LeaseClaim::Acquire | LeaseClaim::Renew => {}
        }

        let Some(mut lease) = existing else {
            return Ok(false);
        };
        let acquiring = claim == LeaseClaim::Acquire;
        lease.spec = Some(self.spec_for(lease.spec.as_ref(), now, acquiring));
        let won = self.write(
            self.api
                .replace(&self.config.name, &PostParams::default(), &lease)
                .await,
        )?;
        if won && acquiring {
            info!(identity = %self.config.identity, "Acquired lease");
        }
        Ok(won)
    }

    fn spec_for(&self, previous: Option<&LeaseSpec>, now: DateTime<Utc>, acquiring: bool) -> LeaseSpec {
        let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: i32::try_from(self.config.lease_duration.as_secs()).ok(),
            acquire_time: if acquiring {
                Some(MicroTime(now))
            } else {
                previous.and_then(|s| s.acquire_time.clone())
            },
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if acquiring && previous.is_some() {
                transitions + 1
            } else {
                transitions
            }),
        }
    }

    /// A conflicting write means another replica got there first
    fn write(&self, result: std::result::Result<Lease, kube::Error>) -> Result<bool> {
        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("Lost lease race");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Campaign until `shutdown` fires. The receiver turns false when the
    /// lease could not be renewed within its duration.
    pub fn spawn(self, shutdown: CancellationToken) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.renew_interval);
            let mut last_renewal: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let leading = match self.try_acquire_or_renew().await {
                    Ok(true) => {
                        last_renewal = Some(Instant::now());
                        true
                    }
                    Ok(false) => false,
                    Err(e) => {
                        warn!(error = %e, "Lease renewal failed");
                        last_renewal
                            .map(|at| at.elapsed() < self.config.lease_duration)
                            .unwrap_or(false)
                    }
                };
                tx.send_if_modified(|current| {
                    if *current == leading {
                        return false;
                    }
                    if leading {
                        info!(identity = %self.config.identity, "Leading");
                    } else {
                        warn!(identity = %self.config.identity, "Not leading");
                    }
                    *current = leading;
                    true
                });
            }
            tx.send_replace(false);
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: &str, renewed_secs_ago: i64, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(duration),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
            ..Default::default()
        }
    }

    const DEFAULT: Duration = Duration::from_secs(15);

    #[test]
    fn test_missing_or_empty_lease_is_claimed() {
        let now = Utc::now();
        assert_eq!(decide(false, None, "a", now, DEFAULT), LeaseClaim::Create);
        assert_eq!(decide(true, None, "a", now, DEFAULT), LeaseClaim::Acquire);
        assert_eq!(
            decide(true, Some(&LeaseSpec::default()), "a", now, DEFAULT),
            LeaseClaim::Acquire
        );
    }

    #[test]
    fn test_own_lease_is_renewed() {
        assert_eq!(
            decide(true, Some(&spec("a", 100, 15)), "a", Utc::now(), DEFAULT),
            LeaseClaim::Renew
        );
    }

    #[test]
    fn test_live_lease_of_another_replica_is_respected() {
        assert_eq!(
            decide(true, Some(&spec("b", 3, 15)), "a", Utc::now(), DEFAULT),
            LeaseClaim::Held { holder: "b".into() }
        );
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        assert_eq!(
            decide(true, Some(&spec("b", 20, 15)), "a", Utc::now(), DEFAULT),
            LeaseClaim::Acquire
        );

        // Never renewed
        let stale = LeaseSpec {
            holder_identity: Some("b".into()),
            ..Default::default()
        };
        assert_eq!(decide(true, Some(&stale), "a", Utc::now(), DEFAULT), LeaseClaim::Acquire);
    }

    #[test]
    fn test_config_validation() {
        assert!(LeaseConfig::new("openebs", "pod-0").validate().is_ok());
        assert!(LeaseConfig::new("", "pod-0").validate().is_err());
        assert!(LeaseConfig::new("openebs", "").validate().is_err());

        let mut config = LeaseConfig::new("openebs", "pod-0");
        config.renew_interval = config.lease_duration;
        assert!(config.validate().is_err());
    }
}
