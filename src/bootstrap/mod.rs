//! Webhook bootstrap
//!
//! Before the admission server starts, the process makes sure the cluster
//! can reach it: a secret with a self-signed CA and server certificate, a
//! service in front of the webhook pods, and a validating webhook
//! configuration trusting the CA. All three are owned by the webhook's
//! deployment so deleting the deployment cleans them up.

pub mod certs;
pub mod webhook;

pub use certs::CertBundle;

use tracing::info;

use crate::client::ClientSet;
use crate::error::{Error, Result};
use webhook::{
    bundle_from_secret, cert_secret, create_once, deployment_owner, webhook_configuration,
    webhook_service,
};

/// Names and settings of the objects bootstrap manages
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Namespace of the secret and the service
    pub namespace: String,
    /// Deployment that owns everything bootstrap creates
    pub deployment: String,
    pub service_name: String,
    pub secret_name: String,
    pub webhook_config_name: String,
    /// Name of the webhook entry inside the configuration
    pub handler_name: String,
    pub service_port: u16,
    /// Port the admission server listens on
    pub target_port: u16,
    pub timeout_seconds: i32,
    pub cert_validity_days: u32,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            deployment: String::new(),
            service_name: "admission-server-svc".into(),
            secret_name: "admission-server-secret".into(),
            webhook_config_name: "openebs-validation-webhook-cfg".into(),
            handler_name: "admission-webhook.openebs.io".into(),
            service_port: 443,
            target_port: 8443,
            timeout_seconds: 5,
            cert_validity_days: 3650,
        }
    }
}

impl BootstrapConfig {
    pub fn new(namespace: &str, deployment: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            deployment: deployment.to_string(),
            ..Default::default()
        }
    }

    pub fn with_target_port(mut self, port: u16) -> Self {
        self.target_port = port;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Configuration("OPENEBS_NAMESPACE must be set".into()));
        }
        if self.deployment.is_empty() {
            return Err(Error::Configuration(
                "ADMISSION_WEBHOOK_NAME must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Ensure secret, service and webhook configuration exist. Returns the
/// certificate material stored in the secret.
pub async fn bootstrap(clients: &ClientSet, config: &BootstrapConfig) -> Result<CertBundle> {
    config.validate()?;
    info!(namespace = %config.namespace, deployment = %config.deployment, "Bootstrapping admission webhook");

    let deployment = clients
        .deployments
        .get_opt(&config.deployment)
        .await?
        .ok_or_else(|| {
            Error::Configuration(format!(
                "admission deployment {} not found in {}",
                config.deployment, config.namespace
            ))
        })?;
    let owner = deployment_owner(&deployment)?;

    let bundle = match clients.secrets.get_opt(&config.secret_name).await? {
        Some(existing) => {
            info!(secret = %config.secret_name, "Reusing certificate secret");
            bundle_from_secret(&existing)?
        }
        None => {
            info!(secret = %config.secret_name, "Generating webhook certificates");
            let generated = CertBundle::generate(
                &config.service_name,
                &config.namespace,
                config.cert_validity_days,
            )?;
            let stored = create_once(
                clients.secrets.as_ref(),
                &cert_secret(config, &generated, &owner),
            )
            .await?;
            bundle_from_secret(&stored)?
        }
    };

    create_once(clients.services.as_ref(), &webhook_service(config, &owner)).await?;
    create_once(
        clients.webhook_configs.as_ref(),
        &webhook_configuration(config, &bundle.ca_cert, &owner),
    )
    .await?;

    info!(
        service = %config.service_name,
        webhook = %config.webhook_config_name,
        "Admission webhook registered"
    );
    Ok(bundle)
}
