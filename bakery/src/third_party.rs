//! third party discharger information
use std::collections::HashMap;

use parking_lot::RwLock;

use crate::checkers::{Caveat, Namespace};
use crate::crypto::{KeyPair, PublicKey};
use crate::error;
use crate::macaroon::VERSION_1;

/// public key and protocol version of a discharger
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThirdPartyInfo {
    pub public_key: PublicKey,
    pub version: u32,
}

/// a third party caveat, as decrypted by the discharger it is addressed to
#[derive(Clone, Debug)]
pub struct ThirdPartyCaveatInfo {
    pub condition: String,
    pub first_party_public_key: PublicKey,
    pub third_party_key_pair: KeyPair,
    /// root key of the discharge macaroon
    pub root_key: Vec<u8>,
    /// encrypted caveat payload
    pub caveat: Vec<u8>,
    /// bakery version the caveat was encoded with
    pub version: u32,
    /// caveat id, which becomes the discharge macaroon id
    pub id: Vec<u8>,
    pub namespace: Namespace,
}

/// finds the discharger information for a third party caveat location
pub trait ThirdPartyLocator: Send + Sync {
    /// fails with [`error::Bakery::ThirdPartyInfoNotFound`] when the
    /// location is unknown
    fn third_party_info(&self, location: &str) -> Result<ThirdPartyInfo, error::Bakery>;
}

impl<T: ThirdPartyLocator + ?Sized> ThirdPartyLocator for std::sync::Arc<T> {
    fn third_party_info(&self, location: &str) -> Result<ThirdPartyInfo, error::Bakery> {
        (**self).third_party_info(location)
    }
}

/// in memory [`ThirdPartyLocator`]
///
/// locations are stored without their trailing slashes
#[derive(Debug, Default)]
pub struct ThirdPartyStore {
    store: RwLock<HashMap<String, ThirdPartyInfo>>,
}

impl ThirdPartyStore {
    pub fn new() -> Self {
        ThirdPartyStore::default()
    }

    pub fn add_info(&self, location: &str, info: ThirdPartyInfo) {
        self.store
            .write()
            .insert(canonical_location(location).to_string(), info);
    }
}

impl ThirdPartyLocator for ThirdPartyStore {
    fn third_party_info(&self, location: &str) -> Result<ThirdPartyInfo, error::Bakery> {
        self.store
            .read()
            .get(canonical_location(location))
            .cloned()
            .ok_or_else(|| error::Bakery::ThirdPartyInfoNotFound(location.to_string()))
    }
}

/// removes the trailing slashes of a location
pub fn canonical_location(location: &str) -> &str {
    location.trim_end_matches('/')
}

const LOCAL_PREFIX: &str = "local ";

/// parses a `local [<version>] <public key>` location
///
/// caveats at such a location are discharged by the client itself, with
/// the private key matching the embedded public key
pub fn parse_local_location(location: &str) -> Option<ThirdPartyInfo> {
    let rest = location.strip_prefix(LOCAL_PREFIX)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let (version, key) = match fields.as_slice() {
        [key] => (VERSION_1, *key),
        [version, key] => (version.parse().ok()?, *key),
        _ => return None,
    };
    let public_key = key.parse().ok()?;
    Some(ThirdPartyInfo {
        public_key,
        version,
    })
}

/// a third party caveat discharged by the client holding the private key
/// matching `key`
///
/// the condition is left empty, it is replaced when the caveat is added to
/// a macaroon
pub fn local_third_party_caveat(key: &PublicKey, version: u32) -> Caveat {
    let location = if version == VERSION_1 {
        format!("{}{}", LOCAL_PREFIX, key)
    } else {
        format!("{}{} {}", LOCAL_PREFIX, version, key)
    };
    Caveat::third_party(location, "")
}
