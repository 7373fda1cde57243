//! minting macaroons for operations
//!
//! The [`Oven`] encodes the operations a macaroon grants in the macaroon
//! id itself:
//!
//! ```text
//! version byte (3) | protobuf MacaroonId { nonce, storage_id, ops }
//! ```
//!
//! where `ops` groups the actions by entity. When a macaroon is minted for
//! several operations and an [`OpsStore`] is configured, the operations
//! are stored under a `multi-<hash>` entity and the id only carries that
//! entity. Version 1 macaroons need a textual id, so the binary id is
//! base64 encoded.
use std::sync::Arc;

use prost::Message;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::checkers::{legacy_namespace, time_before_caveat, Caveat, Namespace};
use crate::crypto::KeyPair;
use crate::error;
use crate::format::{b64decode, raw_urlsafe_b64encode, schema, MacaroonVersion, RawMacaroon};
use crate::macaroon::{macaroon_version, Macaroon, LATEST_VERSION, VERSION_2, VERSION_3};
use crate::op::{canonical_ops, Op, LOGIN_OP};
use crate::store::{MemoryKeyStore, OpsStore, RootKeyStore};
use crate::third_party::ThirdPartyLocator;

const NONCE_LEN: usize = 16;
const MULTI_ENTITY_PREFIX: &str = "multi-";

/// maps a macaroon to the operations it grants
pub trait MacaroonOpStore: Send + Sync {
    /// verifies the signature of `macaroons`, a root macaroon followed by
    /// its discharges, and returns the operations it grants along with
    /// all the first party conditions found in the macaroon and its
    /// discharges
    ///
    /// returns [`error::Bakery::Verification`] when the macaroon is not
    /// valid, any other error aborts the authorization
    fn macaroon_ops(
        &self,
        macaroons: &[RawMacaroon],
    ) -> Result<(Vec<Op>, Vec<String>), error::Bakery>;
}

/// parameters of an [`Oven`]
#[derive(Default)]
pub struct OvenParams {
    /// namespace of the first party caveats, the legacy namespace by default
    pub namespace: Option<Namespace>,
    /// location of the minted macaroons
    pub location: String,
    /// key used to encrypt third party caveats
    pub key: Option<KeyPair>,
    pub locator: Option<Arc<dyn ThirdPartyLocator>>,
    /// a [`MemoryKeyStore`] by default
    pub root_key_store: Option<Arc<dyn RootKeyStore>>,
    pub ops_store: Option<Arc<dyn OpsStore>>,
}

/// mints macaroons and finds the operations they grant
pub struct Oven {
    namespace: Namespace,
    location: String,
    key: Option<KeyPair>,
    locator: Option<Arc<dyn ThirdPartyLocator>>,
    root_key_store: Arc<dyn RootKeyStore>,
    ops_store: Option<Arc<dyn OpsStore>>,
}

impl Oven {
    pub fn new(params: OvenParams) -> Self {
        Oven {
            namespace: params.namespace.unwrap_or_else(legacy_namespace),
            location: params.location,
            key: params.key,
            locator: params.locator,
            root_key_store: params
                .root_key_store
                .unwrap_or_else(|| Arc::new(MemoryKeyStore::new())),
            ops_store: params.ops_store,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn key(&self) -> Option<&KeyPair> {
        self.key.as_ref()
    }

    pub fn locator(&self) -> Option<&dyn ThirdPartyLocator> {
        self.locator.as_deref()
    }

    /// mints a macaroon granting `ops`, expiring at `expiry` and carrying
    /// `caveats`
    pub fn macaroon(
        &self,
        version: u32,
        expiry: OffsetDateTime,
        caveats: &[Caveat],
        ops: &[Op],
    ) -> Result<Macaroon, error::Bakery> {
        if ops.is_empty() {
            return Err(error::Bakery::InvalidArgument(
                "cannot mint a macaroon associated with no operations".to_string(),
            ));
        }
        let ops = canonical_ops(ops);
        let (root_key, storage_id) = self.root_key_store.root_key()?;

        let id = self.new_macaroon_id(storage_id, expiry, &ops)?;
        let mut id_bytes = vec![LATEST_VERSION as u8];
        id.encode(&mut id_bytes)
            .map_err(|e| error::Format::SerializationError(e.to_string()))?;
        if macaroon_version(version) == MacaroonVersion::V1 {
            id_bytes = raw_urlsafe_b64encode(&id_bytes).into_bytes();
        }

        let mut m = Macaroon::new(
            &root_key,
            id_bytes,
            &self.location,
            version,
            self.namespace.clone(),
        )?;
        m.add_caveat(&time_before_caveat(expiry), self.key(), self.locator())?;
        m.add_caveats(caveats, self.key(), self.locator())?;
        Ok(m)
    }

    fn new_macaroon_id(
        &self,
        storage_id: Vec<u8>,
        expiry: OffsetDateTime,
        ops: &[Op],
    ) -> Result<schema::MacaroonId, error::Bakery> {
        let mut nonce = vec![0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ops = match &self.ops_store {
            Some(store) if ops.len() > 1 => {
                let entity = ops_entity(ops);
                store.put_ops(&entity, expiry, ops)?;
                vec![schema::Op {
                    entity,
                    actions: vec!["*".to_string()],
                }]
            }
            _ => macaroon_id_ops(ops),
        };

        Ok(schema::MacaroonId {
            nonce,
            storage_id,
            ops,
        })
    }
}

impl MacaroonOpStore for Oven {
    fn macaroon_ops(
        &self,
        macaroons: &[RawMacaroon],
    ) -> Result<(Vec<Op>, Vec<String>), error::Bakery> {
        let (primary, discharges) = macaroons.split_first().ok_or_else(|| {
            error::Bakery::InvalidArgument("no macaroons provided".to_string())
        })?;

        let (storage_id, mut ops) = decode_macaroon_id(primary.identifier())?;
        let root_key = self
            .root_key_store
            .get(&storage_id)?
            .ok_or_else(|| {
                error::Bakery::Verification("macaroon key not found in storage".to_string())
            })?;

        let mut conditions = Vec::new();
        primary.verify(&root_key, discharges, |condition| {
            conditions.push(condition.to_string());
            Ok(())
        })?;

        let multi_entity = match ops.as_slice() {
            [op] if op.entity.starts_with(MULTI_ENTITY_PREFIX) => Some(op.entity.to_string()),
            _ => None,
        };
        if let (Some(store), Some(entity)) = (&self.ops_store, multi_entity) {
            ops = store.get_ops(&entity)?;
        }
        Ok((ops, conditions))
    }
}

/// entity under which a set of canonical operations is stored
pub fn ops_entity(ops: &[Op]) -> String {
    let mut hasher = Sha256::new();
    for op in ops {
        hasher.update(op.entity.as_bytes());
        hasher.update(b"\n");
        hasher.update(op.action.as_bytes());
        hasher.update(b"\n");
    }
    let hash = hasher.finalize();
    format!(
        "{}{}",
        MULTI_ENTITY_PREFIX,
        base64::encode_config(hash, base64::STANDARD_NO_PAD)
    )
}

/// groups canonical operations by entity
fn macaroon_id_ops(ops: &[Op]) -> Vec<schema::Op> {
    let mut id_ops: Vec<schema::Op> = Vec::new();
    for op in ops {
        if let Some(last) = id_ops.last_mut() {
            if last.entity == op.entity() {
                last.actions.push(op.action.to_string());
                continue;
            }
        }
        id_ops.push(schema::Op {
            entity: op.entity.to_string(),
            actions: vec![op.action.to_string()],
        });
    }
    id_ops
}

/// returns the storage id and the operations encoded in a macaroon id
fn decode_macaroon_id(id: &[u8]) -> Result<(Vec<u8>, Vec<Op>), error::Bakery> {
    let mut id = id.to_vec();
    let mut base64_decoded = false;

    // 'A' is the base64 encoding of the high bits of a version 2 or 3 byte
    if id.first() == Some(&b'A') {
        if let Ok(decoded) = std::str::from_utf8(&id)
            .map_err(|_| ())
            .and_then(|s| b64decode(s).map_err(|_| ()))
        {
            id = decoded;
            base64_decoded = true;
        }
    }

    let first = match id.first() {
        Some(&b) => b,
        None => return Ok((Vec::new(), vec![LOGIN_OP])),
    };

    if u32::from(first) == VERSION_3 {
        let macaroon_id = schema::MacaroonId::decode(&id[1..]).map_err(|_| no_operations())?;
        match macaroon_id.ops.first() {
            Some(op) if !op.actions.is_empty() => {}
            _ => return Err(no_operations()),
        }
        let ops = macaroon_id
            .ops
            .into_iter()
            .flat_map(|op| {
                let entity = op.entity;
                op.actions
                    .into_iter()
                    .map(move |action| Op::new(entity.clone(), action))
            })
            .collect();
        return Ok((macaroon_id.storage_id, ops));
    }

    let mut storage_id = Vec::new();
    if u32::from(first) == VERSION_2 {
        // a 16 byte UUID precedes the storage id
        storage_id = id.get(1 + 16..).map(<[u8]>::to_vec).unwrap_or_default();
    } else if !base64_decoded && is_lower_case_hex_char(first) {
        // legacy id, a hex encoded storage id followed by a dash suffix
        if let Some(last) = id.iter().rposition(|&b| b == b'-') {
            storage_id = id[..last].to_vec();
        }
    }
    Ok((storage_id, vec![LOGIN_OP]))
}

fn is_lower_case_hex_char(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

fn no_operations() -> error::Bakery {
    error::Bakery::Verification("no operations found in macaroon".to_string())
}
