//! Validating admission webhook
//!
//! Reviews PoolClusterClaim create/update/delete and VolumeClaim
//! update/delete requests. Every decision travels inside an HTTP 200
//! AdmissionReview; the status code of the embedded result tells the
//! decision apart:
//!
//! - 202: allowed
//! - 400: the embedded object could not be decoded
//! - 403: refused by policy (a volume still has clones)
//! - 422: the change is semantically invalid
//! - 500: the cluster could not be read

pub mod pool_cluster_claim;
pub mod replacement;
pub mod server;
pub mod volume_claim;

pub use server::{router, serve_tls, tls_acceptor, AdmissionState};

use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

use crate::client::ClientFabricator;
use crate::crd::{PoolClusterClaim, VolumeClaim};
use crate::error::{Error, Result};

/// Route the API server calls
pub const VALIDATE_PATH: &str = "/validate";

/// Admission server settings
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub listen_addr: SocketAddr,
    /// Upper bound for answering one review
    pub review_timeout: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            review_timeout: Duration::from_secs(10),
        }
    }
}

/// Decision code carried in the review result
pub fn decision_code(error: &Error) -> u16 {
    match error {
        Error::Policy(_) => 403,
        Error::JsonParse(_) => 400,
        Error::Kube(_)
        | Error::Internal(_)
        | Error::Timeout(_)
        | Error::Io(_)
        | Error::Conflict { .. }
        | Error::Certificate(_)
        | Error::Tls(_) => 500,
        _ => 422,
    }
}

/// Answers admission requests against the current cluster state
#[derive(Clone)]
pub struct Validator {
    clients: ClientFabricator,
}

impl Validator {
    pub fn new(clients: ClientFabricator) -> Self {
        Self { clients }
    }

    /// Decide on one request
    pub async fn review(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let kind = req.kind.kind.as_str();
        let outcome = match kind {
            "PoolClusterClaim" => self.review_pool_cluster_claim(req).await,
            "VolumeClaim" => self.review_volume_claim(req).await,
            _ => {
                debug!(kind, "No rules for kind, allowing");
                Ok(())
            }
        };

        let mut response = AdmissionResponse::from(req);
        match outcome {
            Ok(()) => {
                response.result.code = 202;
                response
            }
            Err(e) => {
                let code = decision_code(&e);
                info!(kind, name = %req.name, operation = ?req.operation, code, reason = %e, "Admission denied");
                let mut response = response.deny(e.to_string());
                response.result.code = code;
                response
            }
        }
    }

    async fn review_pool_cluster_claim(&self, req: &AdmissionRequest<DynamicObject>) -> Result<()> {
        let clients = (self.clients)();
        match req.operation {
            Operation::Create => {
                let pcc: PoolClusterClaim = decode(req.object.as_ref())?;
                pool_cluster_claim::validate_create(&pcc, &clients)
                    .await
                    .map_err(wrap_specification)
            }
            Operation::Update => {
                let new: PoolClusterClaim = decode(req.object.as_ref())?;
                let old = match req.old_object.as_ref() {
                    Some(obj) => decode(Some(obj))?,
                    None => clients.pool_cluster_claims.get(&req.name).await?,
                };
                pool_cluster_claim::validate_update(&old, &new, &clients)
                    .await
                    .map_err(wrap_specification)
            }
            Operation::Delete => {
                let existing: Option<PoolClusterClaim> = match req.old_object.as_ref() {
                    Some(obj) => Some(decode(Some(obj))?),
                    None => clients.pool_cluster_claims.get_opt(&req.name).await?,
                };
                pool_cluster_claim::validate_delete(&req.name, existing.as_ref(), &clients).await
            }
            _ => Ok(()),
        }
    }

    async fn review_volume_claim(&self, req: &AdmissionRequest<DynamicObject>) -> Result<()> {
        let clients = (self.clients)();
        match req.operation {
            Operation::Update => {
                let new: VolumeClaim = decode(req.object.as_ref())?;
                let old = match req.old_object.as_ref() {
                    Some(obj) => decode(Some(obj))?,
                    None => clients.volume_claims.get(&req.name).await?,
                };
                volume_claim::validate_update(&old, &new)
            }
            Operation::Delete => {
                let vc = match req.old_object.as_ref() {
                    Some(obj) => decode(Some(obj))?,
                    None => match clients.volume_claims.get_opt(&req.name).await? {
                        Some(vc) => vc,
                        None => return Ok(()),
                    },
                };
                volume_claim::validate_delete(&vc, &clients).await
            }
            _ => Ok(()),
        }
    }
}

/// Typed view of an embedded object
fn decode<K: DeserializeOwned>(obj: Option<&DynamicObject>) -> Result<K> {
    let obj = obj.ok_or_else(|| Error::Validation("request carries no object".into()))?;
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

fn wrap_specification(e: Error) -> Error {
    match e {
        Error::Validation(m) => {
            Error::Validation(format!("invalid pool cluster claim specification: {}", m))
        }
        other => other,
    }
}
