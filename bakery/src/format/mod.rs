//! macaroon serialization
//!
//! The signature chain itself (first and third party caveats, binding of
//! discharges and verification) is the one of the `macaroon` crate, which
//! follows the libmacaroons construction. [`RawMacaroon`] wraps it with the
//! JSON formats the bakery exchanges: the original field-named one
//! (`MacaroonVersion::V1`) and the compact one (`MacaroonVersion::V2`).
use crate::crypto::KEY_LEN;
use crate::error::{self, Format};

use macaroon::{ByteString, Caveat as LibCaveat, Macaroon as LibMacaroon, MacaroonKey, Verifier};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Once;
use std::{fmt, iter, str};
use tracing::warn;

/// Structures for the binary macaroon identifier
pub mod schema;

pub mod codec;

// field types of the binary macaroon format
const FIELD_EOS: u8 = 0;
const FIELD_LOCATION: u8 = 1;
const FIELD_IDENTIFIER: u8 = 2;
const FIELD_VID: u8 = 4;
const FIELD_SIGNATURE: u8 = 6;
const BINARY_V2: u8 = 2;

/// serialization format of the underlying macaroon
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MacaroonVersion {
    V1,
    V2,
}

/// caveat as stored in the signature chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawCaveat {
    /// condition of a first party caveat, or caveat id of a third party one
    pub id: Vec<u8>,
    /// encrypted caveat root key, only present on third party caveats
    pub verification_id: Option<Vec<u8>>,
    pub location: Option<String>,
}

impl RawCaveat {
    pub fn is_first_party(&self) -> bool {
        self.verification_id.is_none()
    }

    pub fn is_third_party(&self) -> bool {
        self.verification_id.is_some()
    }

    /// the location, treating an empty one as absent
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref().filter(|l| !l.is_empty())
    }
}

/// Signed macaroon, without any bakery-level metadata
#[derive(Clone)]
pub struct RawMacaroon {
    inner: LibMacaroon,
    version: MacaroonVersion,
    // decoded from `inner` after every change
    location: String,
    identifier: Vec<u8>,
    caveats: Vec<RawCaveat>,
    signature: [u8; KEY_LEN],
}

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(|| {
        if macaroon::initialize().is_err() {
            warn!("could not initialize the macaroon crypto primitives");
        }
    });
}

fn key_bytes(key: &MacaroonKey) -> [u8; KEY_LEN] {
    let bytes: &[u8; KEY_LEN] = key.as_ref();
    *bytes
}

/// accepts every first party condition, they are checked by the caller
fn any_condition(_: &ByteString) -> bool {
    true
}

impl RawMacaroon {
    pub fn new(
        root_key: &[u8],
        identifier: Vec<u8>,
        location: impl Into<String>,
        version: MacaroonVersion,
    ) -> Result<Self, Format> {
        init();
        let location: String = location.into();
        let location = if location.is_empty() {
            None
        } else {
            Some(location)
        };
        let inner = LibMacaroon::create(location, &MacaroonKey::generate(root_key), identifier.into())?;
        Ok(RawMacaroon::wrap(inner, version))
    }

    fn wrap(inner: LibMacaroon, version: MacaroonVersion) -> Self {
        let mut m = RawMacaroon {
            inner,
            version,
            location: String::new(),
            identifier: Vec::new(),
            caveats: Vec::new(),
            signature: [0; KEY_LEN],
        };
        m.refresh();
        m
    }

    fn refresh(&mut self) {
        self.location = self
            .inner
            .location()
            .map(|l| l.to_string())
            .unwrap_or_default();
        self.identifier = self.inner.identifier().0.clone();
        self.signature = key_bytes(&self.inner.signature());
        self.caveats = self
            .inner
            .caveats()
            .iter()
            .map(|c| match c {
                LibCaveat::FirstParty(c) => RawCaveat {
                    id: c.predicate().0.clone(),
                    verification_id: None,
                    location: None,
                },
                LibCaveat::ThirdParty(c) => RawCaveat {
                    id: c.id().0.clone(),
                    verification_id: Some(c.verifier_id().0.clone()),
                    location: Some(c.location().to_string()),
                },
            })
            .collect();
    }

    /// rebuilds a macaroon from its decoded fields
    fn from_parts(
        location: &str,
        identifier: &[u8],
        caveats: &[RawCaveat],
        signature: &[u8],
        version: MacaroonVersion,
    ) -> Result<Self, Format> {
        init();
        let mut buf = vec![BINARY_V2];
        if !location.is_empty() {
            append_field(&mut buf, FIELD_LOCATION, location.as_bytes());
        }
        append_field(&mut buf, FIELD_IDENTIFIER, identifier);
        buf.push(FIELD_EOS);
        for caveat in caveats {
            if let Some(location) = caveat.location() {
                append_field(&mut buf, FIELD_LOCATION, location.as_bytes());
            }
            append_field(&mut buf, FIELD_IDENTIFIER, &caveat.id);
            if let Some(vid) = &caveat.verification_id {
                append_field(&mut buf, FIELD_VID, vid);
            }
            buf.push(FIELD_EOS);
        }
        buf.push(FIELD_EOS);
        append_field(&mut buf, FIELD_SIGNATURE, signature);

        let inner = LibMacaroon::deserialize(raw_urlsafe_b64encode(&buf))?;
        Ok(RawMacaroon::wrap(inner, version))
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    pub fn caveats(&self) -> &[RawCaveat] {
        &self.caveats
    }

    pub fn signature(&self) -> &[u8; KEY_LEN] {
        &self.signature
    }

    pub fn version(&self) -> MacaroonVersion {
        self.version
    }

    /// appends a caveat checked by the target service itself
    pub fn add_first_party_caveat(&mut self, condition: &[u8]) -> Result<(), Format> {
        self.inner.add_first_party_caveat(condition.to_vec().into());
        self.refresh();
        Ok(())
    }

    /// appends a caveat that must be discharged by the third party at
    /// `location`, which will sign its discharge with `root_key`
    pub fn add_third_party_caveat(
        &mut self,
        location: &str,
        root_key: &[u8],
        id: Vec<u8>,
    ) -> Result<(), Format> {
        self.inner
            .add_third_party_caveat(location, &MacaroonKey::generate(root_key), id.into());
        self.refresh();
        Ok(())
    }

    /// binds a discharge macaroon to this macaroon
    ///
    /// the returned macaroon is the one that must be sent with the request
    pub fn bind(&self, discharge: &RawMacaroon) -> Result<RawMacaroon, Format> {
        let mut bound = discharge.inner.clone();
        self.inner.bind(&mut bound);
        Ok(RawMacaroon::wrap(bound, discharge.version))
    }

    /// verifies the signature chain of this macaroon and of the bound
    /// `discharges` it needs
    ///
    /// `check` is then called with every first party condition, of the
    /// primary macaroon first and of the discharges in order
    pub fn verify<F>(
        &self,
        root_key: &[u8],
        discharges: &[RawMacaroon],
        mut check: F,
    ) -> Result<(), error::Bakery>
    where
        F: FnMut(&str) -> Result<(), String>,
    {
        let mut verifier = Verifier::default();
        verifier.satisfy_general(any_condition);
        verifier
            .verify(
                &self.inner,
                &MacaroonKey::generate(root_key),
                discharges.iter().map(|d| d.inner.clone()).collect(),
            )
            .map_err(|e| {
                error::Bakery::Verification(format!(
                    "macaroon {} does not verify: {:?}",
                    display_id(&self.identifier),
                    e
                ))
            })?;

        let conditions = iter::once(self)
            .chain(discharges)
            .flat_map(|m| m.caveats.iter())
            .filter(|c| c.is_first_party());
        for caveat in conditions {
            let condition = str::from_utf8(&caveat.id).map_err(|_| {
                error::Bakery::Verification("caveat condition is not valid UTF-8".to_string())
            })?;
            check(condition).map_err(error::Bakery::Verification)?;
        }
        Ok(())
    }

    /// JSON representation in this macaroon's format
    pub fn to_json(&self) -> Result<serde_json::Value, Format> {
        serde_json::to_value(self).map_err(|e| Format::SerializationError(e.to_string()))
    }

    /// parses either JSON format
    pub fn from_json(value: serde_json::Value) -> Result<Self, Format> {
        serde_json::from_value(value).map_err(|e| Format::DeserializationError(e.to_string()))
    }

    fn to_json_v1(&self) -> Result<JsonV1, Format> {
        let identifier = String::from_utf8(self.identifier.clone()).map_err(|_| {
            Format::SerializationError("version 1 macaroon id is not valid UTF-8".to_string())
        })?;

        let mut caveats = Vec::with_capacity(self.caveats.len());
        for c in &self.caveats {
            let cid = String::from_utf8(c.id.clone()).map_err(|_| {
                Format::SerializationError(
                    "version 1 caveat id is not valid UTF-8".to_string(),
                )
            })?;
            caveats.push(JsonCaveatV1 {
                cid,
                vid: c.verification_id.as_ref().map(raw_urlsafe_b64encode),
                cl: c.location.clone(),
            });
        }

        Ok(JsonV1 {
            location: self.location.clone(),
            identifier,
            caveats,
            signature: hex::encode(self.signature),
        })
    }

    fn from_json_v1(json: JsonV1) -> Result<Self, Format> {
        let mut caveats = Vec::with_capacity(json.caveats.len());
        for c in json.caveats {
            let verification_id = match c.vid {
                Some(vid) => Some(b64decode(&vid)?),
                None => None,
            };
            caveats.push(RawCaveat {
                id: c.cid.into_bytes(),
                verification_id,
                location: c.cl,
            });
        }

        let signature = hex::decode(&json.signature)
            .map_err(|e| Format::DeserializationError(format!("invalid signature: {}", e)))?;

        RawMacaroon::from_parts(
            &json.location,
            json.identifier.as_bytes(),
            &caveats,
            &signature,
            MacaroonVersion::V1,
        )
    }

    fn to_json_v2(&self) -> JsonV2 {
        let (i, i64) = text_or_base64(&self.identifier);
        let c = self
            .caveats
            .iter()
            .map(|c| {
                let (i, i64) = text_or_base64(&c.id);
                JsonCaveatV2 {
                    i,
                    i64,
                    v64: c.verification_id.as_ref().map(raw_urlsafe_b64encode),
                    l: c.location.clone(),
                }
            })
            .collect();

        JsonV2 {
            c,
            l: if self.location.is_empty() {
                None
            } else {
                Some(self.location.clone())
            },
            i,
            i64,
            s64: raw_urlsafe_b64encode(self.signature),
        }
    }

    fn from_json_v2(json: JsonV2) -> Result<Self, Format> {
        let identifier = binary_field(json.i, json.i64, "macaroon identifier")?;

        let mut caveats = Vec::with_capacity(json.c.len());
        for c in json.c {
            let verification_id = match c.v64 {
                Some(v) => Some(b64decode(&v)?),
                None => None,
            };
            caveats.push(RawCaveat {
                id: binary_field(c.i, c.i64, "caveat id")?,
                verification_id,
                location: c.l,
            });
        }

        let signature = b64decode(&json.s64)?;

        RawMacaroon::from_parts(
            json.l.as_deref().unwrap_or_default(),
            &identifier,
            &caveats,
            &signature,
            MacaroonVersion::V2,
        )
    }
}

impl PartialEq for RawMacaroon {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.location == other.location
            && self.identifier == other.identifier
            && self.caveats == other.caveats
            && self.signature == other.signature
    }
}

impl Eq for RawMacaroon {}

impl fmt::Debug for RawMacaroon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMacaroon")
            .field("location", &self.location)
            .field("identifier", &display_id(&self.identifier))
            .field("caveats", &self.caveats)
            .field("version", &self.version)
            .finish()
    }
}

impl Serialize for RawMacaroon {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.version {
            MacaroonVersion::V1 => self
                .to_json_v1()
                .map_err(serde::ser::Error::custom)?
                .serialize(serializer),
            MacaroonVersion::V2 => self.to_json_v2().serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for RawMacaroon {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match JsonMacaroon::deserialize(deserializer)? {
            JsonMacaroon::V1(json) => RawMacaroon::from_json_v1(json),
            JsonMacaroon::V2(json) => RawMacaroon::from_json_v2(json),
        }
        .map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum JsonMacaroon {
    V1(JsonV1),
    V2(JsonV2),
}

#[derive(Serialize, Deserialize)]
struct JsonV1 {
    #[serde(default)]
    location: String,
    identifier: String,
    #[serde(default)]
    caveats: Vec<JsonCaveatV1>,
    signature: String,
}

#[derive(Serialize, Deserialize)]
struct JsonCaveatV1 {
    cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cl: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct JsonV2 {
    #[serde(default)]
    c: Vec<JsonCaveatV2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    i: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    i64: Option<String>,
    s64: String,
}

#[derive(Serialize, Deserialize)]
struct JsonCaveatV2 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    i: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    i64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l: Option<String>,
}

fn text_or_base64(data: &[u8]) -> (Option<String>, Option<String>) {
    match str::from_utf8(data) {
        Ok(s) => (Some(s.to_string()), None),
        Err(_) => (None, Some(raw_urlsafe_b64encode(data))),
    }
}

fn binary_field(
    text: Option<String>,
    encoded: Option<String>,
    name: &str,
) -> Result<Vec<u8>, Format> {
    match (text, encoded) {
        (Some(_), Some(_)) => Err(Format::DeserializationError(format!(
            "both text and base64 forms of {} provided",
            name
        ))),
        (Some(t), None) => Ok(t.into_bytes()),
        (None, Some(e)) => b64decode(&e),
        (None, None) => Err(Format::DeserializationError(format!("missing {}", name))),
    }
}

fn append_field(buf: &mut Vec<u8>, field: u8, data: &[u8]) {
    buf.push(field);
    encode_uvarint(data.len() as u64, buf);
    buf.extend_from_slice(data);
}

/// printable form of a binary id for error messages
pub(crate) fn display_id(id: &[u8]) -> String {
    match str::from_utf8(id) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => format!("{:?}", s),
        _ => raw_urlsafe_b64encode(id),
    }
}

/// base64 URL-safe encoding without padding
pub fn raw_urlsafe_b64encode<T: AsRef<[u8]>>(data: T) -> String {
    base64::encode_config(data, base64::URL_SAFE_NO_PAD)
}

/// decodes base64 in either the standard or the URL-safe alphabet, with or
/// without padding
pub fn b64decode(s: &str) -> Result<Vec<u8>, Format> {
    let normalized: String = s
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    Ok(base64::decode_config(normalized, base64::URL_SAFE_NO_PAD)?)
}

/// appends `x` to `buf` as an unsigned LEB128 varint
pub(crate) fn encode_uvarint(mut x: u64, buf: &mut Vec<u8>) {
    while x >= 0x80 {
        buf.push((x as u8) | 0x80);
        x >>= 7;
    }
    buf.push(x as u8);
}

/// reads an unsigned LEB128 varint, returns it with the number of bytes read
pub(crate) fn decode_uvarint(buf: &[u8]) -> Result<(u64, usize), Format> {
    let mut x: u64 = 0;
    let mut shift = 0;
    for (i, b) in buf.iter().enumerate() {
        if shift >= 64 {
            break;
        }
        x |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok((x, i + 1));
        }
        shift += 7;
    }
    Err(Format::DeserializationError("invalid varint".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discharged(version: MacaroonVersion) -> (RawMacaroon, RawMacaroon) {
        let mut m = RawMacaroon::new(b"root key", b"id".to_vec(), "service", version).unwrap();
        m.add_first_party_caveat(b"time-before 2030-01-01T00:00:00Z")
            .unwrap();
        m.add_third_party_caveat("https://ids", b"caveat key", b"cav-1".to_vec())
            .unwrap();

        let mut d = RawMacaroon::new(b"caveat key", b"cav-1".to_vec(), "", version).unwrap();
        d.add_first_party_caveat(b"declared username bob").unwrap();
        let bound = m.bind(&d).unwrap();
        (m, bound)
    }

    #[test]
    fn verify_with_discharge() {
        let (m, d) = discharged(MacaroonVersion::V2);
        let mut conditions = Vec::new();
        m.verify(b"root key", &[d.clone()], |c| {
            conditions.push(c.to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(
            conditions,
            vec![
                "time-before 2030-01-01T00:00:00Z".to_string(),
                "declared username bob".to_string()
            ]
        );

        // wrong root key
        assert!(m.verify(b"other key", &[d.clone()], |_| Ok(())).is_err());
        // missing discharge
        assert!(m.verify(b"root key", &[], |_| Ok(())).is_err());
        // the check callback can reject a condition
        let res = m.verify(b"root key", &[d], |c| {
            if c.starts_with("declared") {
                Err("nope".to_string())
            } else {
                Ok(())
            }
        });
        assert_eq!(res, Err(error::Bakery::Verification("nope".to_string())));
    }

    #[test]
    fn unbound_discharge_is_rejected() {
        let (m, _) = discharged(MacaroonVersion::V2);
        let mut d = RawMacaroon::new(b"caveat key", b"cav-1".to_vec(), "", MacaroonVersion::V2)
            .unwrap();
        d.add_first_party_caveat(b"declared username bob").unwrap();
        assert!(m.verify(b"root key", &[d], |_| Ok(())).is_err());
    }

    #[test]
    fn json_v1_and_v2() {
        for version in [MacaroonVersion::V1, MacaroonVersion::V2] {
            let (m, d) = discharged(version);
            let json = serde_json::to_string(&m).unwrap();
            let parsed: RawMacaroon = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, m);
            assert_eq!(parsed.version(), version);
            parsed.verify(b"root key", &[d], |_| Ok(())).unwrap();
        }

        let (m, _) = discharged(MacaroonVersion::V1);
        let value = m.to_json().unwrap();
        assert_eq!(value["identifier"], "id");
        assert_eq!(value["location"], "service");
        assert_eq!(value["caveats"][1]["cl"], "https://ids");
    }

    #[test]
    fn macaroons_from_the_library() {
        let key = MacaroonKey::generate(b"root key");
        let mut m = LibMacaroon::create(Some("service".into()), &key, "id".into()).unwrap();
        m.add_first_party_caveat("declared username bob".into());
        let m = RawMacaroon::wrap(m, MacaroonVersion::V2);
        assert_eq!(m.caveats()[0].id, b"declared username bob");

        let parsed = RawMacaroon::from_json(m.to_json().unwrap()).unwrap();
        assert_eq!(parsed, m);
        let mut conditions = Vec::new();
        parsed
            .verify(b"root key", &[], |c| {
                conditions.push(c.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(conditions, vec!["declared username bob".to_string()]);
    }

    #[test]
    fn binary_identifier() {
        let m = RawMacaroon::new(b"k", vec![3, 0xff, 0x00], "", MacaroonVersion::V2).unwrap();
        let value = m.to_json().unwrap();
        assert!(value.get("i").is_none());
        assert_eq!(value["i64"], raw_urlsafe_b64encode([3, 0xff, 0x00]));
        assert_eq!(RawMacaroon::from_json(value).unwrap(), m);

        let v1 = RawMacaroon::new(b"k", vec![3, 0xff], "", MacaroonVersion::V1).unwrap();
        assert!(v1.to_json().is_err());
    }

    #[test]
    fn base64_variants() {
        let data = vec![0xfb, 0xff, 0xbf, 0x01];
        assert_eq!(b64decode(&base64::encode(&data)).unwrap(), data);
        assert_eq!(
            b64decode(&base64::encode_config(&data, base64::URL_SAFE)).unwrap(),
            data
        );
        assert_eq!(b64decode(&raw_urlsafe_b64encode(&data)).unwrap(), data);
    }

    #[test]
    fn varint() {
        for x in [0u64, 1, 127, 128, 300, u64::from(u32::MAX)] {
            let mut buf = vec![];
            encode_uvarint(x, &mut buf);
            assert_eq!(decode_uvarint(&buf).unwrap(), (x, buf.len()));
        }
        assert!(decode_uvarint(&[0x80, 0x80]).is_err());
    }
}
