use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    StateConflict(String),

    #[error("security violation: {0}")]
    Security(#[from] SecurityViolation),

    #[error("external service failure: {0}")]
    ExternalService(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("invalid configuration: {field} - {reason}")]
    Config { field: String, reason: String },
}

/// Coarse classification callers use to map failures onto responses or alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    StateConflict,
    Security,
    ExternalService,
    Crypto,
    Storage,
    Config,
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::StateConflict(_) => ErrorKind::StateConflict,
            Error::Security(_) => ErrorKind::Security,
            Error::ExternalService(_) => ErrorKind::ExternalService,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Config { .. } => ErrorKind::Config,
        }
    }

    /// True for failures that should raise an alert rather than a plain
    /// client error: lockouts, password mismatches, bad device certificates
    /// and integrity failures during decryption.
    pub fn is_security_relevant(&self) -> bool {
        match self {
            Error::Security(_) => true,
            Error::Crypto(CryptoError::Decryption(_)) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityViolation {
    #[error("invalid pairing password ({attempts_remaining} attempts remaining)")]
    InvalidPairingPassword { attempts_remaining: u32 },

    #[error("pairing session {session_id} is locked after repeated failures")]
    PairingLocked { session_id: String },

    #[error("invalid device certificate: {0}")]
    InvalidDeviceCertificate(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<base64::DecodeError> for CryptoError {
    fn from(err: base64::DecodeError) -> Self {
        CryptoError::Encoding(err.to_string())
    }
}
