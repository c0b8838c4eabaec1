use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Vehicle public-key certificate in the OEM's pipe-delimited format:
/// `VIN:..|PublicKey:..|Issuer:..|ValidFrom:..|ValidUntil:..|Signature:..`,
/// Base64-encoded on the wire. The signature covers everything before
/// `|Signature:`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleCertificate {
    pub vin: String,
    pub public_key: String,
    pub issuer: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub signature: String,
}

impl VehicleCertificate {
    pub fn signed_body(&self) -> String {
        format!(
            "VIN:{}|PublicKey:{}|Issuer:{}|ValidFrom:{}|ValidUntil:{}",
            self.vin,
            self.public_key,
            self.issuer,
            format_time(&self.valid_from),
            format_time(&self.valid_until)
        )
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(format!("{}|Signature:{}", self.signed_body(), self.signature))
    }

    pub fn decode(encoded: &str) -> Result<Self, CryptoError> {
        let text = decode_text(encoded)?;
        let fields: Vec<&str> = text.split('|').collect();
        if fields.len() != 6 {
            return Err(malformed("vehicle certificate", "expected 6 fields"));
        }
        Ok(Self {
            vin: field(fields[0], "VIN")?.to_string(),
            public_key: field(fields[1], "PublicKey")?.to_string(),
            issuer: field(fields[2], "Issuer")?.to_string(),
            valid_from: parse_time(field(fields[3], "ValidFrom")?)?,
            valid_until: parse_time(field(fields[4], "ValidUntil")?)?,
            signature: field(fields[5], "Signature")?.to_string(),
        })
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && at < self.valid_until
    }
}

/// A device OEM certificate re-signed by the vehicle OEM authority:
/// `OriginalCert:..|CrossSignedBy:..|CrossSignedAt:..|CrossSignature:..`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSignedCertificate {
    pub original_certificate: String,
    pub cross_signed_by: String,
    pub cross_signed_at: DateTime<Utc>,
    pub cross_signature: String,
}

impl CrossSignedCertificate {
    pub fn encode(&self) -> String {
        STANDARD.encode(format!(
            "OriginalCert:{}|CrossSignedBy:{}|CrossSignedAt:{}|CrossSignature:{}",
            self.original_certificate,
            self.cross_signed_by,
            format_time(&self.cross_signed_at),
            self.cross_signature
        ))
    }

    pub fn decode(encoded: &str) -> Result<Self, CryptoError> {
        let text = decode_text(encoded)?;
        // the original certificate is opaque, so split the known tail first
        let mut tail = text.rsplitn(4, '|');
        let signature = tail.next();
        let signed_at = tail.next();
        let signed_by = tail.next();
        let original = tail.next();
        match (original, signed_by, signed_at, signature) {
            (Some(original), Some(signed_by), Some(signed_at), Some(signature)) => Ok(Self {
                original_certificate: field(original, "OriginalCert")?.to_string(),
                cross_signed_by: field(signed_by, "CrossSignedBy")?.to_string(),
                cross_signed_at: parse_time(field(signed_at, "CrossSignedAt")?)?,
                cross_signature: field(signature, "CrossSignature")?.to_string(),
            }),
            _ => Err(malformed("cross-signed certificate", "expected 4 fields")),
        }
    }
}

pub(crate) fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, CryptoError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CryptoError::Encoding(format!("bad timestamp '{}': {}", value, e)))
}

fn decode_text(encoded: &str) -> Result<String, CryptoError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    String::from_utf8(bytes).map_err(|e| CryptoError::Encoding(e.to_string()))
}

fn field<'a>(raw: &'a str, name: &str) -> Result<&'a str, CryptoError> {
    raw.strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| malformed("certificate", &format!("missing field {}", name)))
}

fn malformed(what: &str, reason: &str) -> CryptoError {
    CryptoError::Encoding(format!("malformed {}: {}", what, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};

    fn sample() -> VehicleCertificate {
        let now = Utc::now().trunc_subsecs(3);
        VehicleCertificate {
            vin: "1HGCM82633A004352".to_string(),
            public_key: "MFkwEwYHKoZIzj0CAQ==".to_string(),
            issuer: "Vehicle OEM CA".to_string(),
            valid_from: now,
            valid_until: now + Duration::days(5 * 365),
            signature: "MEUCIQ==".to_string(),
        }
    }

    #[test]
    fn vehicle_certificate_wire_format() {
        let cert = sample();
        let text = String::from_utf8(STANDARD.decode(cert.encode()).unwrap()).unwrap();
        assert!(text.starts_with("VIN:1HGCM82633A004352|PublicKey:MFkwEwYHKoZIzj0CAQ==|Issuer:Vehicle OEM CA|ValidFrom:"));
        assert!(text.ends_with("|Signature:MEUCIQ=="));
        assert_eq!(VehicleCertificate::decode(&cert.encode()).unwrap(), cert);
    }

    #[test]
    fn vehicle_certificate_rejects_garbage() {
        assert!(VehicleCertificate::decode("not base64!").is_err());
        assert!(VehicleCertificate::decode(&STANDARD.encode("VIN:X|Issuer:Y")).is_err());
    }

    #[test]
    fn validity_window() {
        let cert = sample();
        assert!(cert.is_valid_at(cert.valid_from));
        assert!(!cert.is_valid_at(cert.valid_until));
        assert!(!cert.is_valid_at(cert.valid_from - Duration::seconds(1)));
    }

    #[test]
    fn cross_signed_keeps_opaque_original() {
        let cross = CrossSignedCertificate {
            original_certificate: "device|cert|with|pipes".to_string(),
            cross_signed_by: "Vehicle OEM CA".to_string(),
            cross_signed_at: Utc::now().trunc_subsecs(3),
            cross_signature: "MEQCIA==".to_string(),
        };
        assert_eq!(CrossSignedCertificate::decode(&cross.encode()).unwrap(), cross);
    }
}
