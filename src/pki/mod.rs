pub mod ca;
pub mod certificate;

pub use ca::{CertificateAuthority, VehicleCredential};
pub use certificate::{CrossSignedCertificate, VehicleCertificate};
