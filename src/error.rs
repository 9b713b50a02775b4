use std::{error, fmt, io};

use num_derive::{FromPrimitive, ToPrimitive};

/// GSS-API major status routine errors, shifted into the routine-error field.
const ROUTINE_ERROR_OFFSET: u32 = 16;
const CALLING_ERROR_OFFSET: u32 = 24;
const GSS_S_FAILURE: u32 = 13 << ROUTINE_ERROR_OFFSET;

/// The kind of a context establishment error.
///
/// Discriminants follow the GSS-API major status layout (RFC 2744, section 3.9.1).
/// Kinds that have no GSS major code of their own are reported as `GSS_S_FAILURE`
/// with a distinct low word so they stay distinguishable.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum ErrorKind {
    BadMech = 1 << ROUTINE_ERROR_OFFSET,
    BadName = 2 << ROUTINE_ERROR_OFFSET,
    BadNameType = 3 << ROUTINE_ERROR_OFFSET,
    /// Channel bindings of the peers do not match, or the checksum binding is malformed.
    BadBindings = 4 << ROUTINE_ERROR_OFFSET,
    BadSignature = 6 << ROUTINE_ERROR_OFFSET,
    NoCredentials = 7 << ROUTINE_ERROR_OFFSET,
    DefectiveToken = 9 << ROUTINE_ERROR_OFFSET,
    ContextExpired = 12 << ROUTINE_ERROR_OFFSET,
    Failure = GSS_S_FAILURE,
    /// The context was stepped in a state that cannot accept input.
    CallBadStructure = 3 << CALLING_ERROR_OFFSET,

    DuplicateToken = 1 << 1,
    OldToken = 1 << 2,
    UnseqToken = 1 << 3,
    GapToken = 1 << 4,

    CryptoFailure = GSS_S_FAILURE | 0x01,
    EncodingFailure = GSS_S_FAILURE | 0x02,
    ResourceExhausted = GSS_S_FAILURE | 0x03,
    TruncatedData = GSS_S_FAILURE | 0x04,
    InvalidParameter = GSS_S_FAILURE | 0x05,
    TimeSkew = GSS_S_FAILURE | 0x06,
}

impl ErrorKind {
    /// Major status word to report to a GSS-API caller.
    pub fn major_status(self) -> u32 {
        let code = self as u32;

        if code & 0xffff_0000 == GSS_S_FAILURE {
            GSS_S_FAILURE
        } else {
            code
        }
    }
}

/// Holds the [ErrorKind] and the description of the error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub error_type: ErrorKind,
    pub description: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Allows to fill a new error easily, supplying it with a coherent description.
    pub fn new(error_type: ErrorKind, description: impl ToString) -> Self {
        Self {
            error_type,
            description: description.to_string(),
        }
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.error_type, self.description)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::Failure, format!("IO error: {:?}", err))
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::new(ErrorKind::BadName, format!("UTF-8 error: {:?}", err))
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::new(ErrorKind::BadName, format!("UTF-8 error: {:?}", err))
    }
}

impl From<picky_asn1_der::Asn1DerError> for Error {
    fn from(err: picky_asn1_der::Asn1DerError) -> Self {
        Self::new(ErrorKind::EncodingFailure, format!("ASN.1 DER error: {:?}", err))
    }
}

impl From<picky_asn1::restricted_string::CharSetError> for Error {
    fn from(err: picky_asn1::restricted_string::CharSetError) -> Self {
        Self::new(ErrorKind::BadName, format!("invalid character set: {:?}", err))
    }
}

impl From<picky_krb::crypto::KerberosCryptoError> for Error {
    fn from(err: picky_krb::crypto::KerberosCryptoError) -> Self {
        Self::new(ErrorKind::CryptoFailure, format!("{:?}", err))
    }
}

impl From<picky_krb::crypto::diffie_hellman::DiffieHellmanError> for Error {
    fn from(err: picky_krb::crypto::diffie_hellman::DiffieHellmanError) -> Self {
        Self::new(ErrorKind::CryptoFailure, format!("Diffie-Hellman error: {:?}", err))
    }
}

impl From<picky_krb::gss_api::GssApiMessageError> for Error {
    fn from(err: picky_krb::gss_api::GssApiMessageError) -> Self {
        Self::new(ErrorKind::DefectiveToken, format!("GSS-API token error: {:?}", err))
    }
}

impl From<picky::key::KeyError> for Error {
    fn from(err: picky::key::KeyError) -> Self {
        Self::new(ErrorKind::NoCredentials, format!("private key error: {}", err))
    }
}

impl From<picky::signature::SignatureError> for Error {
    fn from(err: picky::signature::SignatureError) -> Self {
        Self::new(ErrorKind::CryptoFailure, format!("signature error: {}", err))
    }
}

impl From<rsa::Error> for Error {
    fn from(err: rsa::Error) -> Self {
        Self::new(ErrorKind::CryptoFailure, format!("RSA error: {}", err))
    }
}

impl From<time::error::ComponentRange> for Error {
    fn from(err: time::error::ComponentRange) -> Self {
        Self::new(ErrorKind::DefectiveToken, format!("invalid time value: {}", err))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::new(ErrorKind::InvalidParameter, format!("invalid URL: {}", err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::new(
            io::ErrorKind::Other,
            format!("{:?}: {}", err.error_type, err.description),
        )
    }
}
