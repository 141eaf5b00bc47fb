//! Prerequisites reconciled before any component
//!
//! In order: the Housekeeping JWT key pair, the shared Erlang configuration,
//! the pod priority classes and the devices certificate authority.

use chrono::Datelike;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use tracing::{info, instrument};

use crate::crd::{Astarte, PriorityTier};
use crate::error::{Error, Result};

use super::client::ClusterClient;
use super::component::{ensure_component, ensure_created};
use super::components::{
    cfssl_data_claim, devices_ca_secret, housekeeping_private_key_secret,
    housekeeping_public_key_secret, ComponentKind,
};
use super::config::OperatorConfig;
use super::resources::{
    build_data_claim, build_devices_ca_secret, build_erlang_configuration, build_owned_secret,
    build_priority_class,
};

pub const PRIVATE_KEY_FIELD: &str = "private-key";
pub const PUBLIC_KEY_FIELD: &str = "public-key";

#[instrument(skip(client, config, astarte), fields(name = %astarte.name_any(), namespace = astarte.namespace()))]
pub async fn reconcile_prerequisites<C: ClusterClient>(
    client: &C,
    config: &OperatorConfig,
    astarte: &Astarte,
) -> Result<()> {
    ensure_housekeeping_keys(client, astarte).await?;
    ensure_erlang_configuration(client, astarte).await?;
    ensure_priority_classes(client, astarte).await?;
    ensure_certificate_authority(client, config, astarte).await?;
    Ok(())
}

fn secret_field(secret: &Secret, field: &str) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(field))
        .ok_or_else(|| Error::MissingField(format!("{}.data.{}", secret.name_any(), field)))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|_| Error::ValidationError(format!("{}.data.{} is not UTF-8", secret.name_any(), field)))
}

/// Key pair signing Housekeeping JWTs. The private key is generated once;
/// a missing public key is derived from the existing private key.
async fn ensure_housekeeping_keys<C: ClusterClient>(client: &C, astarte: &Astarte) -> Result<()> {
    let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());
    let instance = astarte.name_any();
    let private_name = housekeeping_private_key_secret(&instance);
    let public_name = housekeeping_public_key_secret(&instance);

    let key_pair = match client.get::<Secret>(&namespace, &private_name).await? {
        Some(secret) => KeyPair::from_pem(&secret_field(&secret, PRIVATE_KEY_FIELD)?)?,
        None => {
            let key_pair = KeyPair::generate()?;
            let secret = build_owned_secret(
                astarte,
                ComponentKind::Housekeeping,
                private_name.clone(),
                PRIVATE_KEY_FIELD,
                &key_pair.serialize_pem(),
            );
            ensure_created(client, &namespace, &secret).await?;
            info!("Generated Housekeeping key pair {}", private_name);
            key_pair
        }
    };

    let public = build_owned_secret(
        astarte,
        ComponentKind::HousekeepingApi,
        public_name,
        PUBLIC_KEY_FIELD,
        &key_pair.public_key_pem(),
    );
    ensure_created(client, &namespace, &public).await?;
    Ok(())
}

async fn ensure_erlang_configuration<C: ClusterClient>(
    client: &C,
    astarte: &Astarte,
) -> Result<()> {
    let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());
    client
        .apply::<ConfigMap>(&namespace, &build_erlang_configuration(astarte))
        .await?;
    Ok(())
}

/// Cluster-scoped priority classes, only when pod priorities are enabled
async fn ensure_priority_classes<C: ClusterClient>(client: &C, astarte: &Astarte) -> Result<()> {
    let Some(priorities) = astarte.spec.features.enabled_priorities() else {
        return Ok(());
    };

    let (high, mid, low) = (
        priorities.astarte_high_priority,
        priorities.astarte_mid_priority,
        priorities.astarte_low_priority,
    );
    if !(high > mid && mid > low) {
        return Err(Error::PriorityOrderError(format!(
            "expected high > mid > low, got {high} / {mid} / {low}"
        )));
    }

    for tier in [PriorityTier::High, PriorityTier::Mid, PriorityTier::Low] {
        client
            .apply_priority_class(&build_priority_class(tier, priorities.value_for(tier)))
            .await?;
    }
    Ok(())
}

/// Self-signed CA issuing device certificates, as (certificate, key) PEM
pub fn generate_devices_ca(instance: &str) -> Result<(String, String)> {
    let now = chrono::Utc::now();
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{instance} Devices CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Astarte");
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    params.not_after = rcgen::date_time_ymd(now.year() + 10, now.month() as u8, 1);

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// Devices CA secret, CA data claim and the CA workload itself
async fn ensure_certificate_authority<C: ClusterClient>(
    client: &C,
    config: &OperatorConfig,
    astarte: &Astarte,
) -> Result<()> {
    let namespace = astarte.namespace().unwrap_or_else(|| "default".to_string());
    let instance = astarte.name_any();

    if ComponentKind::Cfssl.is_deployed(&astarte.spec) {
        let ca_name = devices_ca_secret(&instance);
        if client.get::<Secret>(&namespace, &ca_name).await?.is_none() {
            let (cert, key) = generate_devices_ca(&instance)?;
            let secret = build_devices_ca_secret(astarte, ca_name.clone(), &cert, &key);
            if ensure_created(client, &namespace, &secret).await? {
                info!("Generated devices CA {}", ca_name);
            }
        }

        if let Some(storage) = &astarte.spec.cfssl.storage {
            let claim = build_data_claim(
                astarte,
                ComponentKind::Cfssl,
                cfssl_data_claim(&instance),
                storage,
            );
            ensure_created(client, &namespace, &claim).await?;
        }
    }

    ensure_component(client, config, astarte, ComponentKind::Cfssl).await
}
