//! Secret, Service and ValidatingWebhookConfiguration for the webhook
//!
//! Every object is created once and reused unchanged afterwards.

use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use tracing::info;

use super::certs::CertBundle;
use super::BootstrapConfig;
use crate::admission::VALIDATE_PATH;
use crate::client::{kind_of, ClusterObject, ResourceClient};
use crate::crd::API_GROUP;
use crate::error::{Error, Result};

/// Secret key holding the server certificate
pub const SERVER_CERT_KEY: &str = "app.crt";
/// Secret key holding the server private key
pub const SERVER_KEY_KEY: &str = "app.pem";
/// Secret key holding the signing CA
pub const CA_CERT_KEY: &str = "ca.crt";

const APP_LABEL: &str = "app";
const APP_LABEL_VALUE: &str = "admission-webhook";

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), APP_LABEL_VALUE.to_string())])
}

fn meta(name: &str, namespace: Option<&str>, owner: &OwnerReference) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels()),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}

/// Controller reference to the deployment running the webhook
pub fn deployment_owner(deployment: &Deployment) -> Result<OwnerReference> {
    let name = deployment.metadata.name.clone().unwrap_or_default();
    let uid = deployment
        .metadata
        .uid
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::Configuration(format!("deployment {} has no uid", name)))?;
    Ok(OwnerReference {
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Create `obj` unless an object of that name exists. Either way the stored
/// object is returned.
pub async fn create_once<K: ClusterObject>(client: &dyn ResourceClient<K>, obj: &K) -> Result<K> {
    let name = obj.meta().name.clone().unwrap_or_default();
    if let Some(existing) = client.get_opt(&name).await? {
        info!(kind = %kind_of::<K>(), %name, "Reusing existing object");
        return Ok(existing);
    }
    match client.create(obj).await {
        Ok(created) => {
            info!(kind = %kind_of::<K>(), %name, "Created object");
            Ok(created)
        }
        // Lost a race with another replica
        Err(e) if e.is_already_exists() => client.get(&name).await,
        Err(e) => Err(e),
    }
}

// =============================================================================
// Secret
// =============================================================================

pub fn cert_secret(config: &BootstrapConfig, bundle: &CertBundle, owner: &OwnerReference) -> Secret {
    Secret {
        metadata: meta(&config.secret_name, Some(&config.namespace), owner),
        type_: Some("Opaque".into()),
        data: Some(BTreeMap::from([
            (SERVER_CERT_KEY.to_string(), ByteString(bundle.server_cert.clone())),
            (SERVER_KEY_KEY.to_string(), ByteString(bundle.server_key.clone())),
            (CA_CERT_KEY.to_string(), ByteString(bundle.ca_cert.clone())),
        ])),
        ..Default::default()
    }
}

/// Certificate material stored in `secret`
pub fn bundle_from_secret(secret: &Secret) -> Result<CertBundle> {
    let name = secret.metadata.name.as_deref().unwrap_or("unknown");
    let field = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|b| b.0.clone())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::Tls(format!("{} value not found in {} secret", key, name)))
    };
    Ok(CertBundle {
        ca_cert: field(CA_CERT_KEY)?,
        server_cert: field(SERVER_CERT_KEY)?,
        server_key: field(SERVER_KEY_KEY)?,
    })
}

// =============================================================================
// Service
// =============================================================================

pub fn webhook_service(config: &BootstrapConfig, owner: &OwnerReference) -> Service {
    Service {
        metadata: meta(&config.service_name, Some(&config.namespace), owner),
        spec: Some(ServiceSpec {
            selector: Some(labels()),
            ports: Some(vec![ServicePort {
                name: Some("webhook".into()),
                protocol: Some("TCP".into()),
                port: i32::from(config.service_port),
                target_port: Some(IntOrString::Int(i32::from(config.target_port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// ValidatingWebhookConfiguration
// =============================================================================

fn rule(operations: &[&str], resource: &str) -> RuleWithOperations {
    RuleWithOperations {
        api_groups: Some(vec![API_GROUP.to_string()]),
        api_versions: Some(vec!["v1".to_string()]),
        operations: Some(operations.iter().map(|o| o.to_string()).collect()),
        resources: Some(vec![resource.to_string()]),
        scope: Some("Cluster".into()),
    }
}

pub fn webhook_configuration(
    config: &BootstrapConfig,
    ca_bundle: &[u8],
    owner: &OwnerReference,
) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: meta(&config.webhook_config_name, None, owner),
        webhooks: Some(vec![ValidatingWebhook {
            name: config.handler_name.clone(),
            admission_review_versions: vec!["v1".into()],
            client_config: WebhookClientConfig {
                ca_bundle: Some(ByteString(ca_bundle.to_vec())),
                service: Some(ServiceReference {
                    name: config.service_name.clone(),
                    namespace: config.namespace.clone(),
                    path: Some(VALIDATE_PATH.into()),
                    port: Some(i32::from(config.service_port)),
                }),
                url: None,
            },
            rules: Some(vec![
                rule(&["CREATE", "UPDATE", "DELETE"], "poolclusterclaims"),
                rule(&["UPDATE", "DELETE"], "volumeclaims"),
            ]),
            failure_policy: Some("Fail".into()),
            side_effects: "None".into(),
            timeout_seconds: Some(config.timeout_seconds),
            ..Default::default()
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryCluster;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            name: "admission".into(),
            uid: "uid-deploy".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn test_secret_round_trips_bundle() {
        let bundle = CertBundle {
            ca_cert: b"ca".to_vec(),
            server_cert: b"crt".to_vec(),
            server_key: b"key".to_vec(),
        };
        let secret = cert_secret(&BootstrapConfig::new("openebs", "admission"), &bundle, &owner());
        assert_eq!(bundle_from_secret(&secret).unwrap(), bundle);

        let mut broken = secret.clone();
        broken.data.as_mut().unwrap().remove(CA_CERT_KEY);
        assert!(bundle_from_secret(&broken).is_err());
    }

    #[test]
    fn test_webhook_configuration_shape() {
        let config = BootstrapConfig::new("openebs", "admission");
        let vwc = webhook_configuration(&config, b"pem", &owner());
        let hook = &vwc.webhooks.as_ref().unwrap()[0];
        assert_eq!(hook.name, "admission-webhook.openebs.io");
        assert_eq!(hook.failure_policy.as_deref(), Some("Fail"));
        assert_eq!(hook.timeout_seconds, Some(5));
        let service = hook.client_config.service.as_ref().unwrap();
        assert_eq!(service.path.as_deref(), Some("/validate"));
        assert_eq!(service.namespace, "openebs");
        assert_eq!(hook.client_config.ca_bundle.as_ref().unwrap().0, b"pem".to_vec());
        assert_eq!(hook.rules.as_ref().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_once_keeps_existing() {
        let cluster = MemoryCluster::new();
        let clients = cluster.client_set();
        let config = BootstrapConfig::new("openebs", "admission");

        let first = webhook_service(&config, &owner());
        create_once(clients.services.as_ref(), &first).await.unwrap();

        let mut second = webhook_service(&config, &owner());
        second.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].port = 9999;
        let stored = create_once(clients.services.as_ref(), &second).await.unwrap();
        assert_eq!(stored.spec.unwrap().ports.unwrap()[0].port, 443);
    }
}
