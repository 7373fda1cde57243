//! third party caveat payload encoding
//!
//! The payload of a third party caveat carries the caveat root key and the
//! condition, encrypted for the third party. Version 1 payloads are
//! base64-encoded JSON. Version 2 and 3 payloads are binary:
//!
//! ```text
//! version (1 byte)
//! third party public key prefix (4 bytes)
//! first party public key (32 bytes)
//! nonce (12 bytes)
//! sealed secret part
//! ```
//!
//! and the secret part is:
//!
//! ```text
//! version (1 byte)
//! root key length (uvarint) | root key
//! namespace length (uvarint) | namespace   (version 3 only)
//! condition
//! ```
use serde::{Deserialize, Serialize};

use super::{b64decode, decode_uvarint, encode_uvarint};
use crate::checkers::Namespace;
use crate::crypto::{KeyPair, PublicKey, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::error::{self, Format};
use crate::macaroon::{VERSION_1, VERSION_2, VERSION_3};
use crate::third_party::{ThirdPartyCaveatInfo, ThirdPartyInfo};

const PUBLIC_KEY_PREFIX_LEN: usize = 4;

/// smallest valid version 3 payload, shorter ids starting with the version
/// 3 byte are bare caveat ids whose payload was not provided
const VERSION3_CAVEAT_MIN_LEN: usize =
    1 + PUBLIC_KEY_PREFIX_LEN + KEY_LEN + NONCE_LEN + TAG_LEN + 1;

#[derive(Serialize, Deserialize)]
struct CaveatRecordV1 {
    #[serde(rename = "ThirdPartyPublicKey")]
    third_party_public_key: String,
    #[serde(rename = "FirstPartyPublicKey")]
    first_party_public_key: String,
    #[serde(rename = "Nonce")]
    nonce: String,
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Serialize, Deserialize)]
struct SecretPartV1 {
    #[serde(rename = "RootKey")]
    root_key: String,
    #[serde(rename = "Condition")]
    condition: String,
}

/// encrypts a third party caveat for the third party described by `info`
///
/// the payload format follows `info.version`
pub fn encode_caveat(
    condition: &str,
    root_key: &[u8],
    info: &ThirdPartyInfo,
    key: &KeyPair,
    namespace: &Namespace,
) -> Result<Vec<u8>, Format> {
    match info.version {
        VERSION_1 => encode_caveat_v1(condition, root_key, &info.public_key, key),
        VERSION_2 | VERSION_3 => encode_caveat_v2_v3(
            info.version,
            condition,
            root_key,
            &info.public_key,
            key,
            namespace,
        ),
        v => Err(Format::Version(v)),
    }
}

fn encode_caveat_v1(
    condition: &str,
    root_key: &[u8],
    third_party_public_key: &PublicKey,
    key: &KeyPair,
) -> Result<Vec<u8>, Format> {
    let secret = serde_json::to_vec(&SecretPartV1 {
        root_key: base64::encode(root_key),
        condition: condition.to_string(),
    })
    .map_err(|e| Format::SerializationError(e.to_string()))?;

    let (nonce, sealed) = key.seal(third_party_public_key, &secret)?;

    let record = serde_json::to_vec(&CaveatRecordV1 {
        third_party_public_key: third_party_public_key.to_base64(),
        first_party_public_key: key.public().to_base64(),
        nonce: base64::encode(nonce),
        id: base64::encode(sealed),
    })
    .map_err(|e| Format::SerializationError(e.to_string()))?;

    Ok(base64::encode(record).into_bytes())
}

fn encode_caveat_v2_v3(
    version: u32,
    condition: &str,
    root_key: &[u8],
    third_party_public_key: &PublicKey,
    key: &KeyPair,
    namespace: &Namespace,
) -> Result<Vec<u8>, Format> {
    let mut secret = vec![version as u8];
    encode_uvarint(root_key.len() as u64, &mut secret);
    secret.extend_from_slice(root_key);
    if version >= VERSION_3 {
        let ns = namespace.serialize_text();
        encode_uvarint(ns.len() as u64, &mut secret);
        secret.extend_from_slice(ns.as_bytes());
    }
    secret.extend_from_slice(condition.as_bytes());

    let (nonce, sealed) = key.seal(third_party_public_key, &secret)?;

    let mut data = vec![version as u8];
    data.extend_from_slice(&third_party_public_key.to_bytes()[..PUBLIC_KEY_PREFIX_LEN]);
    data.extend_from_slice(&key.public().to_bytes());
    data.extend_from_slice(&nonce);
    data.extend_from_slice(&sealed);
    Ok(data)
}

/// decrypts a third party caveat payload addressed to `key`
///
/// the returned info has an empty `id`, the caller fills it in
pub fn decode_caveat(key: &KeyPair, caveat: &[u8]) -> Result<ThirdPartyCaveatInfo, error::Bakery> {
    match caveat.first() {
        None => Err(error::Bakery::Verification(
            "empty third party caveat".to_string(),
        )),
        // base64-encoded JSON object
        Some(b'e') => decode_caveat_v1(key, caveat),
        Some(&v) if u32::from(v) == VERSION_2 || u32::from(v) == VERSION_3 => {
            if u32::from(v) == VERSION_3 && caveat.len() < VERSION3_CAVEAT_MIN_LEN {
                return Err(error::Bakery::Verification(format!(
                    "caveat id payload not provided for caveat id {}",
                    super::display_id(caveat)
                )));
            }
            decode_caveat_v2_v3(u32::from(v), key, caveat)
        }
        Some(_) => Err(error::Bakery::Verification(
            "unknown version for caveat".to_string(),
        )),
    }
}

fn decode_caveat_v1(key: &KeyPair, caveat: &[u8]) -> Result<ThirdPartyCaveatInfo, error::Bakery> {
    let data = std::str::from_utf8(caveat)
        .map_err(|_| verification("caveat is not valid base64"))
        .and_then(|s| b64decode(s).map_err(|e| verification(&e.to_string())))?;
    let record: CaveatRecordV1 = serde_json::from_slice(&data)
        .map_err(|e| verification(&format!("cannot unmarshal caveat record: {}", e)))?;

    let third_party_public_key = PublicKey::from_base64(&record.third_party_public_key)?;
    if third_party_public_key != key.public() {
        return Err(verification("public key mismatch"));
    }
    let first_party_public_key = PublicKey::from_base64(&record.first_party_public_key)?;
    let nonce = b64decode(&record.nonce)?;
    let sealed = b64decode(&record.id)?;

    let secret = key
        .open(&first_party_public_key, &nonce, &sealed)
        .map_err(|e| verification(&format!("cannot decrypt caveat: {}", e)))?;
    let secret: SecretPartV1 = serde_json::from_slice(&secret)
        .map_err(|e| verification(&format!("cannot unmarshal caveat: {}", e)))?;

    Ok(ThirdPartyCaveatInfo {
        condition: secret.condition,
        first_party_public_key,
        third_party_key_pair: key.clone(),
        root_key: b64decode(&secret.root_key)?,
        caveat: caveat.to_vec(),
        version: VERSION_1,
        id: Vec::new(),
        namespace: crate::checkers::legacy_namespace(),
    })
}

fn decode_caveat_v2_v3(
    version: u32,
    key: &KeyPair,
    caveat: &[u8],
) -> Result<ThirdPartyCaveatInfo, error::Bakery> {
    let header_len = 1 + PUBLIC_KEY_PREFIX_LEN + KEY_LEN + NONCE_LEN;
    if caveat.len() < header_len + TAG_LEN {
        return Err(verification("caveat id too short"));
    }
    let mut rest = &caveat[1..];

    let (prefix, r) = rest.split_at(PUBLIC_KEY_PREFIX_LEN);
    rest = r;
    if prefix != &key.public().to_bytes()[..PUBLIC_KEY_PREFIX_LEN] {
        return Err(verification("public key mismatch"));
    }

    let (first_party, r) = rest.split_at(KEY_LEN);
    rest = r;
    let first_party_public_key = PublicKey::from_bytes(first_party)?;

    let (nonce, sealed) = rest.split_at(NONCE_LEN);
    let secret = key
        .open(&first_party_public_key, nonce, sealed)
        .map_err(|e| verification(&format!("cannot decrypt caveat: {}", e)))?;

    let (root_key, namespace, condition) = decode_secret_part_v2_v3(version, &secret)?;

    Ok(ThirdPartyCaveatInfo {
        condition,
        first_party_public_key,
        third_party_key_pair: key.clone(),
        root_key,
        caveat: caveat.to_vec(),
        version,
        id: Vec::new(),
        namespace,
    })
}

fn decode_secret_part_v2_v3(
    version: u32,
    data: &[u8],
) -> Result<(Vec<u8>, Namespace, String), error::Bakery> {
    let (&secret_version, mut rest) = data
        .split_first()
        .ok_or_else(|| verification("secret part too short"))?;
    if u32::from(secret_version) != version {
        return Err(verification("unexpected secret part version"));
    }

    let (root_key_len, n) = decode_uvarint(rest)?;
    rest = &rest[n..];
    let root_key_len = root_key_len as usize;
    if rest.len() < root_key_len {
        return Err(verification("root key length too long"));
    }
    let (root_key, r) = rest.split_at(root_key_len);
    rest = r;

    let namespace = if version >= VERSION_3 {
        let (ns_len, n) = decode_uvarint(rest)?;
        rest = &rest[n..];
        let ns_len = ns_len as usize;
        if rest.len() < ns_len {
            return Err(verification("namespace length too long"));
        }
        let (ns, r) = rest.split_at(ns_len);
        rest = r;
        let ns = std::str::from_utf8(ns).map_err(|_| verification("invalid namespace"))?;
        Namespace::deserialize_text(ns)
            .map_err(|e| verification(&format!("cannot unmarshal namespace: {}", e)))?
    } else {
        crate::checkers::legacy_namespace()
    };

    let condition = String::from_utf8(rest.to_vec())
        .map_err(|_| verification("caveat condition is not valid UTF-8"))?;

    Ok((root_key.to_vec(), namespace, condition))
}

fn verification(message: &str) -> error::Bakery {
    error::Bakery::Verification(message.to_string())
}
