//! bakery level macaroons
//!
//! A [`Macaroon`] wraps the signed [`RawMacaroon`] with the bakery version
//! it was created for, the namespace its first party caveats are written
//! in and, from version 3 on, the encrypted payloads of its third party
//! caveats. Version 3 keeps those payloads out of the signature chain so
//! that the caveat ids stay short.
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::checkers::{legacy_namespace, Caveat, Namespace};
use crate::crypto::{generate_root_key, KeyPair};
use crate::error::{self, Format};
use crate::format::codec::encode_caveat;
use crate::format::{b64decode, encode_uvarint, MacaroonVersion, RawMacaroon};
use crate::third_party::{parse_local_location, ThirdPartyInfo, ThirdPartyLocator};

/// the version used before bakery versions were introduced
pub const VERSION_0: u32 = 0;
/// adds third party caveats with JSON-encoded payloads
pub const VERSION_1: u32 = 1;
/// binary third party caveat payloads and binary macaroon ids
pub const VERSION_2: u32 = 2;
/// namespaces, and caveat payloads stored outside of the macaroon
pub const VERSION_3: u32 = 3;
pub const LATEST_VERSION: u32 = VERSION_3;

/// length of the root keys generated for third party caveats
const CAVEAT_ROOT_KEY_LEN: usize = 24;

/// location recorded in the macaroon for caveats discharged by the client
pub const LOCAL_LOCATION: &str = "local";

/// a root macaroon followed by the discharges bound to it
pub type Slice = Vec<RawMacaroon>;

/// format of the underlying macaroon for a bakery version
pub fn macaroon_version(bakery_version: u32) -> MacaroonVersion {
    if bakery_version <= VERSION_1 {
        MacaroonVersion::V1
    } else {
        MacaroonVersion::V2
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Macaroon {
    macaroon: RawMacaroon,
    version: u32,
    namespace: Namespace,
    caveat_data: BTreeMap<Vec<u8>, Vec<u8>>,
    caveat_id_prefix: Vec<u8>,
}

impl Macaroon {
    /// creates a macaroon signed with `root_key`
    pub fn new(
        root_key: &[u8],
        id: Vec<u8>,
        location: &str,
        version: u32,
        namespace: Namespace,
    ) -> Result<Self, error::Bakery> {
        if version > LATEST_VERSION {
            return Err(Format::Version(version).into());
        }
        let macaroon = RawMacaroon::new(root_key, id, location, macaroon_version(version))?;
        Ok(Macaroon {
            macaroon,
            version,
            namespace,
            caveat_data: BTreeMap::new(),
            caveat_id_prefix: Vec::new(),
        })
    }

    pub fn macaroon(&self) -> &RawMacaroon {
        &self.macaroon
    }

    pub fn into_macaroon(self) -> RawMacaroon {
        self.macaroon
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn caveat_data(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.caveat_data
    }

    /// ids of new third party caveats start with `prefix`, used for the
    /// caveats a discharger adds to a discharge macaroon
    pub(crate) fn set_caveat_id_prefix(&mut self, prefix: Vec<u8>) {
        self.caveat_id_prefix = prefix;
    }

    /// adds a caveat
    ///
    /// a first party caveat is written with the prefix of its namespace.
    /// A third party caveat is encrypted for the discharger found through
    /// `locator`, in the lowest version supported by both sides, which
    /// requires the first party `key`.
    pub fn add_caveat(
        &mut self,
        caveat: &Caveat,
        key: Option<&KeyPair>,
        locator: Option<&dyn ThirdPartyLocator>,
    ) -> Result<(), error::Bakery> {
        let location = match caveat.location() {
            None => {
                let resolved = self.namespace.resolve_caveat(caveat);
                self.macaroon
                    .add_first_party_caveat(resolved.condition.as_bytes())?;
                return Ok(());
            }
            Some(location) => location,
        };

        let key = key.ok_or_else(|| {
            error::Bakery::InvalidArgument(
                "no private key to encrypt third party caveat".to_string(),
            )
        })?;

        let (location, condition, info) = match parse_local_location(location) {
            Some(info) => {
                if !caveat.condition.is_empty() {
                    return Err(error::Bakery::InvalidArgument(
                        "cannot specify caveat condition in local third-party caveat"
                            .to_string(),
                    ));
                }
                (LOCAL_LOCATION, "true", info)
            }
            None => {
                let locator = locator.ok_or_else(|| {
                    error::Bakery::InvalidArgument(
                        "no locator when adding third party caveat".to_string(),
                    )
                })?;
                let info = locator.third_party_info(location)?;
                (location, caveat.condition.as_str(), info)
            }
        };

        let info = ThirdPartyInfo {
            version: info.version.min(self.version),
            public_key: info.public_key,
        };

        let root_key = generate_root_key(CAVEAT_ROOT_KEY_LEN);
        let payload = encode_caveat(condition, &root_key, &info, key, &self.namespace)?;

        let id = if info.version < VERSION_3 {
            payload
        } else {
            let id = self.new_caveat_id();
            self.caveat_data.insert(id.clone(), payload);
            id
        };
        self.macaroon.add_third_party_caveat(location, &root_key, id)?;
        Ok(())
    }

    /// adds caveats in order
    pub fn add_caveats(
        &mut self,
        caveats: &[Caveat],
        key: Option<&KeyPair>,
        locator: Option<&dyn ThirdPartyLocator>,
    ) -> Result<(), error::Bakery> {
        for caveat in caveats {
            self.add_caveat(caveat, key, locator)?;
        }
        Ok(())
    }

    /// returns a copy of this macaroon with an additional caveat
    pub fn with_caveat(
        &self,
        caveat: &Caveat,
        key: Option<&KeyPair>,
        locator: Option<&dyn ThirdPartyLocator>,
    ) -> Result<Self, error::Bakery> {
        let mut m = self.clone();
        m.add_caveat(caveat, key, locator)?;
        Ok(m)
    }

    /// a short caveat id, unique in this macaroon
    fn new_caveat_id(&self) -> Vec<u8> {
        let mut base = if self.caveat_id_prefix.is_empty() {
            vec![VERSION_3 as u8]
        } else {
            self.caveat_id_prefix.clone()
        };
        let start = base.len();

        let mut i = self.caveat_data.len() as u64;
        loop {
            base.truncate(start);
            encode_uvarint(i, &mut base);
            let taken = self
                .macaroon
                .caveats()
                .iter()
                .any(|c| c.is_third_party() && c.id == base);
            if !taken {
                return base;
            }
            i += 1;
        }
    }

    /// conditions of the first party caveats, in order
    pub fn first_party_caveats(&self) -> Vec<Caveat> {
        self.macaroon
            .caveats()
            .iter()
            .filter(|c| c.is_first_party())
            .map(|c| Caveat::new(String::from_utf8_lossy(&c.id)))
            .collect()
    }

    /// third party caveats, with their location and raw caveat id
    pub fn third_party_caveats(&self) -> Vec<(Option<String>, Vec<u8>)> {
        self.macaroon
            .caveats()
            .iter()
            .filter(|c| c.is_third_party())
            .map(|c| (c.location.clone(), c.id.clone()))
            .collect()
    }

    /// JSON object representation
    ///
    /// macaroons below version 3 are serialized as the bare macaroon
    pub fn to_dict(&self) -> Result<Value, Format> {
        let m = self.macaroon.to_json()?;
        if self.version < VERSION_3 {
            if !self.caveat_data.is_empty() {
                return Err(Format::SerializationError(
                    "cannot serialize pre-version3 macaroon with external caveat data"
                        .to_string(),
                ));
            }
            return Ok(m);
        }

        let mut dict = json!({
            "m": m,
            "v": self.version,
            "ns": self.namespace.serialize_text(),
        });
        if !self.caveat_data.is_empty() {
            let cdata: serde_json::Map<String, Value> = self
                .caveat_data
                .iter()
                .map(|(id, data)| (base64::encode(id), Value::String(base64::encode(data))))
                .collect();
            dict["cdata"] = Value::Object(cdata);
        }
        Ok(dict)
    }

    /// parses the output of [`Macaroon::to_dict`]
    pub fn from_dict(dict: Value) -> Result<Self, error::Bakery> {
        let version = match dict.get("v") {
            None => return Macaroon::from_pre_v3(dict),
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| Format::DeserializationError("invalid version".to_string()))?,
        };
        if version > LATEST_VERSION {
            return Err(Format::Version(version).into());
        }

        let m = dict
            .get("m")
            .cloned()
            .ok_or_else(|| Format::DeserializationError("no macaroon in object".to_string()))?;
        let macaroon = RawMacaroon::from_json(m)?;
        if macaroon.version() != macaroon_version(version) {
            return Err(Format::DeserializationError(
                "underlying macaroon has inconsistent version".to_string(),
            )
            .into());
        }

        let namespace = match dict.get("ns").and_then(Value::as_str) {
            Some(ns) => Namespace::deserialize_text(ns)?,
            None => legacy_namespace(),
        };

        let mut caveat_data = BTreeMap::new();
        if let Some(cdata) = dict.get("cdata").and_then(Value::as_object) {
            for (id, data) in cdata {
                let data = data.as_str().ok_or_else(|| {
                    Format::DeserializationError("caveat data is not a string".to_string())
                })?;
                caveat_data.insert(b64decode(id)?, b64decode(data)?);
            }
        }

        Ok(Macaroon {
            macaroon,
            version,
            namespace,
            caveat_data,
            caveat_id_prefix: Vec::new(),
        })
    }

    fn from_pre_v3(dict: Value) -> Result<Self, error::Bakery> {
        let macaroon = RawMacaroon::from_json(dict)?;
        let version = match macaroon.version() {
            MacaroonVersion::V1 => VERSION_1,
            MacaroonVersion::V2 => VERSION_2,
        };
        Ok(Macaroon {
            macaroon,
            version,
            namespace: legacy_namespace(),
            caveat_data: BTreeMap::new(),
            caveat_id_prefix: Vec::new(),
        })
    }
}

impl Serialize for Macaroon {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_dict()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Macaroon {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Macaroon::from_dict(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::{allow_caveat, STD_NAMESPACE};
    use crate::format::codec::decode_caveat;
    use crate::third_party::{local_third_party_caveat, ThirdPartyStore};

    fn namespace() -> Namespace {
        let mut ns = Namespace::new();
        ns.register(STD_NAMESPACE, "").unwrap();
        ns.register("testns", "t").unwrap();
        ns
    }

    #[test]
    fn first_party_caveats_use_prefix() {
        let mut m = Macaroon::new(b"key", b"id".to_vec(), "loc", VERSION_3, namespace()).unwrap();
        m.add_caveat(&allow_caveat(&["read"]), None, None).unwrap();
        m.add_caveat(
            &Caveat {
                condition: "foo".to_string(),
                location: None,
                namespace: Some("testns".to_string()),
            },
            None,
            None,
        )
        .unwrap();
        assert_eq!(
            m.first_party_caveats(),
            vec![Caveat::new("allow read"), Caveat::new("t:foo")]
        );
    }

    #[test]
    fn third_party_caveat_version_negotiation() {
        let first = KeyPair::new();
        let third = KeyPair::new();
        let locator = ThirdPartyStore::new();
        locator.add_info(
            "https://ids",
            ThirdPartyInfo {
                public_key: third.public(),
                version: VERSION_2,
            },
        );

        let mut m = Macaroon::new(b"key", b"id".to_vec(), "loc", VERSION_3, namespace()).unwrap();
        let cav = Caveat::third_party("https://ids", "is-authenticated-user");
        m.add_caveat(&cav, Some(&first), Some(&locator)).unwrap();

        // version 2 dischargers get the payload as the caveat id
        assert!(m.caveat_data().is_empty());
        let (location, id) = m.third_party_caveats().remove(0);
        assert_eq!(location.as_deref(), Some("https://ids"));
        let info = decode_caveat(&third, &id).unwrap();
        assert_eq!(info.version, VERSION_2);
        assert_eq!(info.condition, "is-authenticated-user");

        assert!(m.add_caveat(&cav, None, Some(&locator)).is_err());
        assert!(m.add_caveat(&cav, Some(&first), None).is_err());
        assert!(matches!(
            m.add_caveat(
                &Caveat::third_party("https://unknown", "x"),
                Some(&first),
                Some(&locator)
            ),
            Err(error::Bakery::ThirdPartyInfoNotFound(_))
        ));
    }

    #[test]
    fn version3_caveat_data() {
        let first = KeyPair::new();
        let third = KeyPair::new();
        let locator = ThirdPartyStore::new();
        locator.add_info(
            "https://ids",
            ThirdPartyInfo {
                public_key: third.public(),
                version: VERSION_3,
            },
        );

        let mut m = Macaroon::new(b"key", b"id".to_vec(), "loc", VERSION_3, namespace()).unwrap();
        let cav = Caveat::third_party("https://ids", "is-authenticated-user");
        m.add_caveat(&cav, Some(&first), Some(&locator)).unwrap();
        m.add_caveat(&cav, Some(&first), Some(&locator)).unwrap();

        let ids: Vec<Vec<u8>> = m.third_party_caveats().into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec![vec![3, 0], vec![3, 1]]);
        for id in &ids {
            let payload = &m.caveat_data()[id];
            assert_eq!(
                decode_caveat(&third, payload).unwrap().condition,
                "is-authenticated-user"
            );
        }
    }

    #[test]
    fn local_caveat() {
        let first = KeyPair::new();
        let local = KeyPair::new();
        let mut m = Macaroon::new(b"key", b"id".to_vec(), "loc", VERSION_3, namespace()).unwrap();
        m.add_caveat(&local_third_party_caveat(&local.public(), VERSION_3), Some(&first), None)
            .unwrap();

        let (location, id) = m.third_party_caveats().remove(0);
        assert_eq!(location.as_deref(), Some(LOCAL_LOCATION));
        let info = decode_caveat(&local, &m.caveat_data()[&id]).unwrap();
        assert_eq!(info.condition, "true");

        let bad = Caveat::third_party(
            local_third_party_caveat(&local.public(), VERSION_3)
                .location()
                .unwrap(),
            "something",
        );
        assert!(m.add_caveat(&bad, Some(&first), None).is_err());
    }

    #[test]
    fn dict_round_trip() {
        let first = KeyPair::new();
        let third = KeyPair::new();
        let locator = ThirdPartyStore::new();
        locator.add_info(
            "https://ids",
            ThirdPartyInfo {
                public_key: third.public(),
                version: VERSION_3,
            },
        );

        for version in [VERSION_1, VERSION_2, VERSION_3] {
            let mut m =
                Macaroon::new(b"key", b"id".to_vec(), "loc", version, legacy_namespace()).unwrap();
            m.add_caveat(&allow_caveat(&["read"]), None, None).unwrap();
            m.add_caveat(
                &Caveat::third_party("https://ids", "is-authenticated-user"),
                Some(&first),
                Some(&locator),
            )
            .unwrap();

            let dict = m.to_dict().unwrap();
            assert_eq!(dict.get("v").is_some(), version == VERSION_3);
            let parsed = Macaroon::from_dict(dict).unwrap();
            assert_eq!(parsed, m);
            assert_eq!(parsed.version(), version);

            let json = serde_json::to_string(&m).unwrap();
            let parsed: Macaroon = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, m);
        }
    }

    #[test]
    fn inconsistent_version() {
        let m = Macaroon::new(b"key", b"id".to_vec(), "", VERSION_1, legacy_namespace()).unwrap();
        let dict = json!({"m": m.macaroon().to_json().unwrap(), "v": 3});
        assert!(Macaroon::from_dict(dict).is_err());

        assert!(Macaroon::new(b"key", b"id".to_vec(), "", 4, legacy_namespace()).is_err());
    }
}
