use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{Duration, SubsecRound, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::certificate::{CrossSignedCertificate, VehicleCertificate};
use crate::config::CertificateConfig;
use crate::crypto::keys::{self, KeyMaterial};
use crate::crypto::{KeyVault, ecies};
use crate::error::CryptoError;

const AUTHORITY_KEY_ID: &str = "authority";

/// A freshly issued vehicle certificate together with the vehicle key pair
/// it certifies.
#[derive(Debug)]
pub struct VehicleCredential {
    pub certificate: String,
    pub key_pair: KeyMaterial,
}

pub struct CertificateAuthority {
    pub issuer: String,
    validity: Duration,
    vault: Arc<KeyVault>,
    issued_certificates: Arc<RwLock<HashMap<String, VehicleCertificate>>>,
}

impl CertificateAuthority {
    pub fn new(config: &CertificateConfig, vault: Arc<KeyVault>) -> Self {
        Self {
            issuer: config.issuer.clone(),
            validity: Duration::days(365 * config.validity_years),
            vault,
            issued_certificates: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// SPKI DER of the authority key; generated on first use.
    pub async fn authority_public_key(&self) -> Result<Vec<u8>, CryptoError> {
        self.vault
            .get_or_generate(AUTHORITY_KEY_ID)
            .await
            .map_err(certificate_error)
    }

    pub async fn issue_vehicle_certificate(
        &self,
        vin: &str,
    ) -> Result<VehicleCredential, CryptoError> {
        if vin.trim().is_empty() || vin.contains('|') {
            return Err(CryptoError::InvalidInput(format!(
                "invalid certificate subject '{}'",
                vin
            )));
        }

        let key_pair = KeyMaterial::generate();
        if !ecies::validate_key_pair(&key_pair) {
            return Err(CryptoError::CertificateGeneration(format!(
                "vehicle key self-test failed for {}",
                vin
            )));
        }

        let valid_from = Utc::now().trunc_subsecs(3);
        let mut cert = VehicleCertificate {
            vin: vin.to_string(),
            public_key: key_pair.public_key_base64().map_err(certificate_error)?,
            issuer: self.issuer.clone(),
            valid_from,
            valid_until: valid_from + self.validity,
            signature: String::new(),
        };
        cert.signature = STANDARD.encode(self.sign(cert.signed_body().as_bytes()).await?);

        let encoded = cert.encode();
        info!(
            "Issued vehicle certificate for {} (key {})",
            vin,
            key_pair.fingerprint()
        );
        self.issued_certificates
            .write()
            .await
            .insert(vin.to_string(), cert);

        Ok(VehicleCredential {
            certificate: encoded,
            key_pair,
        })
    }

    /// Signs the opaque device certificate and wraps it with issuer and
    /// timestamp metadata.
    pub async fn cross_sign(&self, device_certificate: &str) -> Result<String, CryptoError> {
        if device_certificate.trim().is_empty() {
            return Err(CryptoError::InvalidInput(
                "device certificate cannot be empty".to_string(),
            ));
        }
        let signature = self.sign(device_certificate.as_bytes()).await?;
        let cross = CrossSignedCertificate {
            original_certificate: device_certificate.to_string(),
            cross_signed_by: self.issuer.clone(),
            cross_signed_at: Utc::now().trunc_subsecs(3),
            cross_signature: STANDARD.encode(signature),
        };
        debug!("Cross-signed device certificate ({} bytes)", device_certificate.len());
        Ok(cross.encode())
    }

    /// Parses a vehicle certificate, checks the authority signature and that
    /// it is inside its validity window.
    pub async fn verify_vehicle_certificate(
        &self,
        encoded: &str,
    ) -> Result<VehicleCertificate, CryptoError> {
        let cert = VehicleCertificate::decode(encoded)?;
        if cert.issuer != self.issuer {
            return Err(CryptoError::InvalidInput(format!(
                "certificate issued by unknown authority '{}'",
                cert.issuer
            )));
        }
        keys::decode_public_key_base64(&cert.public_key)?;
        self.check_signature(cert.signed_body().as_bytes(), &cert.signature)
            .await?;
        if !cert.is_valid_at(Utc::now()) {
            return Err(CryptoError::InvalidInput(format!(
                "certificate for {} is outside its validity window",
                cert.vin
            )));
        }
        Ok(cert)
    }

    pub async fn verify_cross_signed(
        &self,
        encoded: &str,
    ) -> Result<CrossSignedCertificate, CryptoError> {
        let cross = CrossSignedCertificate::decode(encoded)?;
        if cross.cross_signed_by != self.issuer {
            return Err(CryptoError::InvalidInput(format!(
                "cross-signed by unknown authority '{}'",
                cross.cross_signed_by
            )));
        }
        self.check_signature(cross.original_certificate.as_bytes(), &cross.cross_signature)
            .await?;
        Ok(cross)
    }

    pub async fn get_certificate(&self, vin: &str) -> Option<VehicleCertificate> {
        self.issued_certificates.read().await.get(vin).cloned()
    }

    pub async fn get_total_issued(&self) -> usize {
        self.issued_certificates.read().await.len()
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.authority_public_key().await?;
        self.vault
            .sign_with(AUTHORITY_KEY_ID, data)
            .await
            .map_err(certificate_error)
    }

    async fn check_signature(&self, data: &[u8], signature_b64: &str) -> Result<(), CryptoError> {
        let signature = STANDARD.decode(signature_b64)?;
        let authority = self.authority_public_key().await?;
        if keys::verify(data, &signature, &authority) {
            Ok(())
        } else {
            Err(CryptoError::InvalidInput(
                "authority signature does not verify".to_string(),
            ))
        }
    }
}

fn certificate_error(err: CryptoError) -> CryptoError {
    match err {
        CryptoError::CertificateGeneration(_) => err,
        other => CryptoError::CertificateGeneration(other.to_string()),
    }
}
