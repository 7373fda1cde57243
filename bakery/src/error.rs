//! error types
//!

use std::convert::{From, Infallible};
use std::fmt;
use thiserror::Error;

use crate::checkers::Caveat;
use crate::op::Op;

/// the global error type for the bakery
#[derive(Error, Clone, Debug, PartialEq)]
pub enum Bakery {
    #[error("internal error")]
    InternalError,
    #[error("error deserializing or encrypting a macaroon: {0}")]
    Format(Format),
    /// a macaroon or one of its discharges did not verify
    #[error("verification failed: {0}")]
    Verification(String),
    /// the client must discharge the attached caveats and try again
    #[error("{0}")]
    DischargeRequired(DischargeRequired),
    /// no caveat discharge can grant the requested operations
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// the third party does not understand the caveat condition
    #[error("caveat not recognized: {0}")]
    CaveatNotRecognized(String),
    /// the caveat condition is understood but does not hold right now
    #[error("third party caveat check failed: {0}")]
    ThirdPartyCaveatCheckFailed(String),
    #[error("third party information not found: {0}")]
    ThirdPartyInfoNotFound(String),
    /// the operation store failed for a reason other than verification
    #[error("cannot initialize authorization: {0}")]
    AuthInit(String),
    #[error("identity error: {0}")]
    Identity(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Bakery {
    /// returns true if acquiring new discharges and retrying can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Bakery::Verification(_)
                | Bakery::DischargeRequired(_)
                | Bakery::ThirdPartyCaveatCheckFailed(_)
        )
    }
}

impl From<Infallible> for Bakery {
    fn from(_: Infallible) -> Self {
        unreachable!()
    }
}

impl From<Format> for Bakery {
    fn from(e: Format) -> Self {
        Bakery::Format(e)
    }
}

impl From<DischargeRequired> for Bakery {
    fn from(e: DischargeRequired) -> Self {
        Bakery::DischargeRequired(e)
    }
}

impl From<base64::DecodeError> for Bakery {
    fn from(e: base64::DecodeError) -> Self {
        Bakery::Format(e.into())
    }
}

impl From<serde_json::Error> for Bakery {
    fn from(e: serde_json::Error) -> Self {
        Bakery::Format(Format::DeserializationError(e.to_string()))
    }
}

/// Returned by the checker when the presented macaroons are not enough
/// to authorize the operations, but discharging a new macaroon carrying
/// `caveats` would be.
#[derive(Clone, Debug, PartialEq)]
pub struct DischargeRequired {
    pub message: String,
    /// operations the new macaroon must be minted for
    pub ops: Vec<Op>,
    /// caveats to add to the new macaroon
    pub caveats: Vec<Caveat>,
    /// set when the discharge is only needed to establish an identity
    pub for_authentication: bool,
}

impl fmt::Display for DischargeRequired {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "discharge required: {}", self.message)
    }
}

/// Errors related to the macaroon serialization format, keys and
/// encryption
#[derive(Error, Clone, Debug, PartialEq)]
pub enum Format {
    #[error("could not deserialize: {0}")]
    DeserializationError(String),
    #[error("could not serialize: {0}")]
    SerializationError(String),
    #[error("unsupported bakery version {0}")]
    Version(u32),
    #[error("invalid key size {0}")]
    InvalidKeySize(usize),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("cannot encrypt: {0}")]
    Encryption(String),
    #[error("cannot decrypt: {0}")]
    Decryption(String),
    #[error("Cannot decode base64: {0}")]
    Base64(Base64Error),
    /// rejected by the macaroon library
    #[error("invalid macaroon: {0}")]
    Macaroon(String),
}

impl From<macaroon::MacaroonError> for Format {
    fn from(e: macaroon::MacaroonError) -> Self {
        Format::Macaroon(format!("{:?}", e))
    }
}

impl From<base64::DecodeError> for Format {
    fn from(e: base64::DecodeError) -> Self {
        let err = match e {
            base64::DecodeError::InvalidByte(offset, byte) => {
                Base64Error::InvalidByte(offset, byte)
            }
            base64::DecodeError::InvalidLength => Base64Error::InvalidLength,
            base64::DecodeError::InvalidLastSymbol(offset, byte) => {
                Base64Error::InvalidLastSymbol(offset, byte)
            }
        };

        Format::Base64(err)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Base64Error {
    InvalidByte(usize, u8),
    InvalidLength,
    InvalidLastSymbol(usize, u8),
}

impl fmt::Display for Base64Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Base64Error::InvalidByte(index, byte) => {
                write!(f, "Invalid byte {}, offset {}.", byte, index)
            }
            Base64Error::InvalidLength => write!(f, "Encoded text cannot have a 6-bit remainder."),
            Base64Error::InvalidLastSymbol(index, byte) => {
                write!(f, "Invalid last symbol {}, offset {}.", byte, index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_format_strings() {
        assert_eq!(
            format!("{}", Bakery::Verification("bad signature".to_owned())),
            "verification failed: bad signature"
        );

        assert_eq!(
            format!("{}", Format::Base64(Base64Error::InvalidLength)),
            "Cannot decode base64: Encoded text cannot have a 6-bit remainder."
        );

        let err = Bakery::DischargeRequired(DischargeRequired {
            message: "authentication required".to_owned(),
            ops: vec![],
            caveats: vec![],
            for_authentication: true,
        });
        assert_eq!(
            format!("{}", err),
            "discharge required: authentication required"
        );
    }

    #[test]
    fn retryable() {
        assert!(Bakery::ThirdPartyCaveatCheckFailed("no user".to_owned()).is_retryable());
        assert!(!Bakery::PermissionDenied("no".to_owned()).is_retryable());
        assert!(!Bakery::AuthInit("store down".to_owned()).is_retryable());
        assert!(!Bakery::CaveatNotRecognized("x".to_owned()).is_retryable());
    }
}
