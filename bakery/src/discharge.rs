//! discharging third party caveats
//!
//! The third party side decodes a caveat addressed to it, checks its
//! condition and mints a discharge macaroon with [`discharge`]. The client
//! side collects the discharges of a macaroon, and of the discharges
//! themselves, with [`discharge_all`].
use std::collections::{BTreeSet, VecDeque};

use tracing::debug;

use crate::checkers::{
    declared_caveat, parse_caveat, Caveat, Context, COND_DECLARED, COND_NEED_DECLARED,
};
use crate::crypto::KeyPair;
use crate::error;
use crate::format::codec::decode_caveat;
use crate::format::RawCaveat;
use crate::macaroon::{Macaroon, Slice, LOCAL_LOCATION};
use crate::third_party::{ThirdPartyCaveatInfo, ThirdPartyLocator};

/// checks the conditions of third party caveats
pub trait ThirdPartyCaveatChecker {
    /// errors returned by the checker, usually carrying protocol specific
    /// information like a required interaction
    type Error: From<error::Bakery>;

    /// returns the caveats to add to the discharge macaroon if the
    /// condition of `info` holds
    ///
    /// fails with [`error::Bakery::CaveatNotRecognized`] when the
    /// condition is not understood, and with
    /// [`error::Bakery::ThirdPartyCaveatCheckFailed`] when it does not hold
    fn check_third_party_caveat(
        &self,
        ctx: &Context,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, Self::Error>;
}

/// a [`ThirdPartyCaveatChecker`] implemented by a function
pub struct ThirdPartyCaveatCheckerFunc<F>(pub F);

impl<F> ThirdPartyCaveatChecker for ThirdPartyCaveatCheckerFunc<F>
where
    F: Fn(&Context, &ThirdPartyCaveatInfo) -> Result<Vec<Caveat>, error::Bakery>,
{
    type Error = error::Bakery;

    fn check_third_party_caveat(
        &self,
        ctx: &Context,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, error::Bakery> {
        (self.0)(ctx, info)
    }
}

/// creates a discharge macaroon for the third party caveat `id`
///
/// `caveat` is the encrypted payload of the caveat when it is stored
/// outside of the caveat id, as version 3 macaroons do. The discharge
/// macaroon has `id` as identifier, no location, and carries the caveats
/// returned by `checker`.
pub fn discharge<C>(
    ctx: &Context,
    id: &[u8],
    caveat: Option<&[u8]>,
    key: &KeyPair,
    checker: &C,
    locator: Option<&dyn ThirdPartyLocator>,
) -> Result<Macaroon, C::Error>
where
    C: ThirdPartyCaveatChecker + ?Sized,
{
    let (caveat, caveat_id_prefix) = match caveat {
        // the payload is in the id itself
        None => (id, Vec::new()),
        // the caveats added to the discharge get ids derived from this one
        Some(caveat) => (caveat, id.to_vec()),
    };

    let mut info = decode_caveat(key, caveat)?;
    info.id = id.to_vec();

    let (cond, arg) = parse_caveat(&info.condition).map_err(error::Bakery::Verification)?;

    let caveats = if cond == COND_NEED_DECLARED {
        info.condition = arg.to_string();
        check_need_declared(ctx, info.clone(), checker)?
    } else {
        checker.check_third_party_caveat(ctx, &info)?
    };

    // the discharge macaroon is never stored, it could otherwise be used
    // to authorize requests to the third party
    let mut m = Macaroon::new(&info.root_key, id.to_vec(), "", info.version, info.namespace)?;
    m.set_caveat_id_prefix(caveat_id_prefix);
    m.add_caveats(&caveats, Some(key), locator)?;
    Ok(m)
}

/// checks the inner condition of a `need-declared` caveat and declares
/// the requested attributes the checker did not declare, with an empty
/// value
fn check_need_declared<C>(
    ctx: &Context,
    mut info: ThirdPartyCaveatInfo,
    checker: &C,
) -> Result<Vec<Caveat>, C::Error>
where
    C: ThirdPartyCaveatChecker + ?Sized,
{
    let arg = info.condition.clone();
    let (keys, condition) = match arg.find(' ') {
        Some(i) if i > 0 => (&arg[..i], &arg[i + 1..]),
        _ => {
            return Err(error::Bakery::Verification(format!(
                "need-declared caveat requires an argument, got {:?}",
                arg
            ))
            .into())
        }
    };
    let need_declared: Vec<&str> = keys.split(',').collect();
    if need_declared.iter().any(|key| key.is_empty()) {
        return Err(error::Bakery::Verification(
            "need-declared caveat with empty required attribute".to_string(),
        )
        .into());
    }

    info.condition = condition.to_string();
    let mut caveats = checker.check_third_party_caveat(ctx, &info)?;

    let mut declared = BTreeSet::new();
    for caveat in &caveats {
        if caveat.is_third_party() {
            continue;
        }
        // caveats that cannot be parsed are left to the target service
        let (cond, arg) = match parse_caveat(&caveat.condition) {
            Ok(parsed) => parsed,
            Err(_) => continue,
        };
        if cond != COND_DECLARED {
            continue;
        }
        let (key, _) = arg.split_once(' ').ok_or_else(|| {
            error::Bakery::Verification("declared caveat has no value".to_string())
        })?;
        declared.insert(key.to_string());
    }

    for key in need_declared {
        if !declared.contains(key) {
            caveats.push(declared_caveat(key, ""));
        }
    }
    Ok(caveats)
}

/// discharges local third party caveats, whose condition is always `true`
struct LocalDischargeChecker;

impl ThirdPartyCaveatChecker for LocalDischargeChecker {
    type Error = error::Bakery;

    fn check_third_party_caveat(
        &self,
        _ctx: &Context,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, error::Bakery> {
        if info.condition != "true" {
            return Err(error::Bakery::CaveatNotRecognized(info.condition.clone()));
        }
        Ok(Vec::new())
    }
}

/// collects the discharges of all the third party caveats of `m`, and of
/// the third party caveats added by the dischargers
///
/// `get_discharge` is called with each caveat and its encrypted payload,
/// when stored outside of the caveat id. Local caveats are discharged with
/// `local_key`. The returned slice starts with the macaroon itself,
/// followed by the discharges bound to it.
pub fn discharge_all<F, E>(
    m: &Macaroon,
    mut get_discharge: F,
    local_key: Option<&KeyPair>,
) -> Result<Slice, E>
where
    F: FnMut(&RawCaveat, Option<&[u8]>) -> Result<Macaroon, E>,
    E: From<error::Bakery>,
{
    let primary = m.macaroon();
    let mut discharges = vec![primary.clone()];

    let mut need: VecDeque<(RawCaveat, Option<Vec<u8>>)> = VecDeque::new();
    add_needed_caveats(m, &mut need);

    while let Some((caveat, payload)) = need.pop_front() {
        let dm = if caveat.location() == Some(LOCAL_LOCATION) {
            let local_key = local_key.ok_or_else(|| {
                error::Bakery::ThirdPartyCaveatCheckFailed(
                    "found local third party caveat but no private key provided".to_string(),
                )
            })?;
            discharge(
                &Context::new(),
                &caveat.id,
                payload.as_deref(),
                local_key,
                &LocalDischargeChecker,
                None,
            )?
        } else {
            get_discharge(&caveat, payload.as_deref())?
        };
        debug!(
            location = caveat.location().unwrap_or_default(),
            "acquired discharge macaroon"
        );

        let bound = primary
            .bind(dm.macaroon())
            .map_err(error::Bakery::from)?;
        discharges.push(bound);
        add_needed_caveats(&dm, &mut need);
    }
    Ok(discharges)
}

fn add_needed_caveats(m: &Macaroon, need: &mut VecDeque<(RawCaveat, Option<Vec<u8>>)>) {
    for caveat in m.macaroon().caveats() {
        if caveat.location().is_none() || caveat.is_first_party() {
            continue;
        }
        let payload = m.caveat_data().get(&caveat.id).cloned();
        need.push_back((caveat.clone(), payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::legacy_namespace;
    use crate::macaroon::{VERSION_1, VERSION_2, VERSION_3};
    use crate::third_party::{local_third_party_caveat, ThirdPartyInfo, ThirdPartyStore};

    struct Dischargers {
        locator: ThirdPartyStore,
        keys: Vec<(String, KeyPair)>,
    }

    impl Dischargers {
        fn new(locations: &[&str], version: u32) -> Self {
            let locator = ThirdPartyStore::new();
            let keys: Vec<(String, KeyPair)> = locations
                .iter()
                .map(|l| (l.to_string(), KeyPair::new()))
                .collect();
            for (location, key) in &keys {
                locator.add_info(
                    location,
                    ThirdPartyInfo {
                        public_key: key.public(),
                        version,
                    },
                );
            }
            Dischargers { locator, keys }
        }

        fn key(&self, location: &str) -> &KeyPair {
            &self.keys.iter().find(|(l, _)| l == location).unwrap().1
        }

        /// discharges every caveat, adding the caveats returned by `extra`
        fn get_discharge<'a>(
            &'a self,
            extra: impl Fn(&str) -> Vec<Caveat> + 'a,
        ) -> impl FnMut(&RawCaveat, Option<&[u8]>) -> Result<Macaroon, error::Bakery> + 'a {
            move |caveat, payload| {
                let location = caveat.location().unwrap().to_string();
                let checker = ThirdPartyCaveatCheckerFunc(
                    |_ctx: &Context,
                     info: &ThirdPartyCaveatInfo|
                     -> Result<Vec<Caveat>, error::Bakery> {
                        assert_eq!(info.condition, "something");
                        Ok(extra(&location))
                    },
                );
                discharge(
                    &Context::new(),
                    &caveat.id,
                    payload,
                    self.key(&location),
                    &checker,
                    Some(&self.locator),
                )
            }
        }
    }

    fn primary(version: u32, first: &KeyPair, d: &Dischargers, location: &str) -> Macaroon {
        let mut m =
            Macaroon::new(b"root key", b"id".to_vec(), "service", version, legacy_namespace())
                .unwrap();
        m.add_caveat(
            &Caveat::third_party(location, "something"),
            Some(first),
            Some(&d.locator),
        )
        .unwrap();
        m
    }

    #[test]
    fn discharge_all_recursive() {
        for version in [VERSION_1, VERSION_2, VERSION_3] {
            let first = KeyPair::new();
            let d = Dischargers::new(&["as1", "as2"], version);
            let m = primary(version, &first, &d, "as1");

            let slice: Slice = discharge_all(
                &m,
                d.get_discharge(|location| {
                    if location == "as1" {
                        vec![Caveat::third_party("as2", "something")]
                    } else {
                        vec![Caveat::new("declared username bob")]
                    }
                }),
                None,
            )
            .unwrap();

            assert_eq!(slice.len(), 3);
            assert_eq!(&slice[0], m.macaroon());
            let mut conditions = Vec::new();
            slice[0]
                .verify(b"root key", &slice[1..], |c| {
                    conditions.push(c.to_string());
                    Ok(())
                })
                .unwrap();
            assert_eq!(conditions, vec!["declared username bob".to_string()]);
        }
    }

    #[test]
    fn discharge_all_without_third_party_caveats() {
        let mut m =
            Macaroon::new(b"root key", b"id".to_vec(), "", VERSION_3, legacy_namespace()).unwrap();
        m.add_caveat(&Caveat::new("true"), None, None).unwrap();

        let slice = discharge_all(
            &m,
            |_, _| -> Result<Macaroon, error::Bakery> { panic!("no discharge expected") },
            None,
        )
        .unwrap();
        assert_eq!(slice, vec![m.macaroon().clone()]);
    }

    #[test]
    fn discharge_all_stops_on_error() {
        let first = KeyPair::new();
        let d = Dischargers::new(&["as1"], VERSION_3);
        let m = primary(VERSION_3, &first, &d, "as1");

        let res = discharge_all(
            &m,
            |_, _| -> Result<Macaroon, error::Bakery> {
                Err(error::Bakery::ThirdPartyCaveatCheckFailed("no user".to_string()))
            },
            None,
        );
        assert_eq!(
            res,
            Err(error::Bakery::ThirdPartyCaveatCheckFailed("no user".to_string()))
        );
    }

    #[test]
    fn local_caveats() {
        let first = KeyPair::new();
        let local = KeyPair::new();
        for version in [VERSION_2, VERSION_3] {
            let mut m =
                Macaroon::new(b"root key", b"id".to_vec(), "", version, legacy_namespace())
                    .unwrap();
            m.add_caveat(&local_third_party_caveat(&local.public(), version), Some(&first), None)
                .unwrap();

            let no_call = |_: &RawCaveat, _: Option<&[u8]>| -> Result<Macaroon, error::Bakery> {
                panic!("local caveats are discharged without a call")
            };
            let slice = discharge_all(&m, no_call, Some(&local)).unwrap();
            assert_eq!(slice.len(), 2);
            slice[0].verify(b"root key", &slice[1..], |_| Ok(())).unwrap();

            assert!(matches!(
                discharge_all(&m, no_call, None),
                Err(error::Bakery::ThirdPartyCaveatCheckFailed(_))
            ));
            assert!(discharge_all(&m, no_call, Some(&first)).is_err());
        }
    }

    #[test]
    fn need_declared() {
        let first = KeyPair::new();
        let d = Dischargers::new(&["as1"], VERSION_3);
        let mut m =
            Macaroon::new(b"root key", b"id".to_vec(), "", VERSION_3, legacy_namespace()).unwrap();
        let cav = crate::checkers::need_declared_caveat(
            &Caveat::third_party("as1", "something"),
            &["username", "groups"],
        );
        m.add_caveat(&cav, Some(&first), Some(&d.locator)).unwrap();

        let slice = discharge_all(
            &m,
            d.get_discharge(|_| vec![declared_caveat("username", "bob")]),
            None,
        )
        .unwrap();

        let mut conditions = Vec::new();
        slice[0]
            .verify(b"root key", &slice[1..], |c| {
                conditions.push(c.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(
            conditions,
            vec![
                "declared username bob".to_string(),
                "declared groups ".to_string()
            ]
        );
    }

    #[test]
    fn need_declared_requires_keys() {
        let first = KeyPair::new();
        let d = Dischargers::new(&["as1"], VERSION_3);
        let mut m =
            Macaroon::new(b"root key", b"id".to_vec(), "", VERSION_3, legacy_namespace()).unwrap();
        m.add_caveat(
            &Caveat::third_party("as1", "need-declared ,username something"),
            Some(&first),
            Some(&d.locator),
        )
        .unwrap();

        let res = discharge_all(&m, d.get_discharge(|_| vec![]), None);
        assert!(matches!(res, Err(error::Bakery::Verification(_))));
    }

    #[test]
    fn discharge_rejects_wrong_key() {
        let first = KeyPair::new();
        let d = Dischargers::new(&["as1"], VERSION_3);
        let m = primary(VERSION_3, &first, &d, "as1");
        let (_, id) = m.third_party_caveats().remove(0);
        let payload = m.caveat_data()[&id].clone();

        let checker = ThirdPartyCaveatCheckerFunc(
            |_: &Context, _: &ThirdPartyCaveatInfo| -> Result<Vec<Caveat>, error::Bakery> {
                Ok(vec![])
            },
        );
        let res = discharge(&Context::new(), &id, Some(&payload), &first, &checker, None);
        assert!(matches!(res, Err(error::Bakery::Verification(_))));

        // a version 3 id without its payload
        let res = discharge(&Context::new(), &id, None, d.key("as1"), &checker, None);
        assert!(res
            .unwrap_err()
            .to_string()
            .contains("caveat id payload not provided"));
    }
}
