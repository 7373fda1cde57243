//! a service's view of the bakery: an oven minting macaroons and a
//! checker authorizing requests with them
use std::sync::Arc;

use crate::authorizer::Authorizer;
use crate::checker::Checker;
use crate::checkers::{self, FirstPartyCaveatChecker};
use crate::crypto::KeyPair;
use crate::identity::IdentityClient;
use crate::oven::{Oven, OvenParams};
use crate::store::{OpsStore, RootKeyStore};
use crate::third_party::ThirdPartyLocator;

/// parameters of a [`Bakery`]
///
/// every field is optional: a bakery without a key or a locator can only
/// mint macaroons with first party caveats, without an authorizer it only
/// allows the operations granted by macaroons
#[derive(Default)]
pub struct BakeryParams {
    /// location of the minted macaroons
    pub location: String,
    pub locator: Option<Arc<dyn ThirdPartyLocator>>,
    /// key used to encrypt third party caveats
    pub key: Option<KeyPair>,
    pub identity_client: Option<Arc<dyn IdentityClient>>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    /// the standard first party checkers by default
    pub checker: Option<Arc<dyn FirstPartyCaveatChecker>>,
    pub root_key_store: Option<Arc<dyn RootKeyStore>>,
    pub ops_store: Option<Arc<dyn OpsStore>>,
}

/// mints macaroons and checks requests for one service
///
/// the oven uses the namespace of the first party checker so the caveats
/// it adds are understood when checking
#[derive(Clone)]
pub struct Bakery {
    oven: Arc<Oven>,
    checker: Checker,
}

impl Bakery {
    pub fn new(params: BakeryParams) -> Self {
        let first_party_checker = params
            .checker
            .unwrap_or_else(|| Arc::new(checkers::Checker::new()));

        let oven = Arc::new(Oven::new(OvenParams {
            namespace: Some(first_party_checker.namespace().clone()),
            location: params.location,
            key: params.key,
            locator: params.locator,
            root_key_store: params.root_key_store,
            ops_store: params.ops_store,
        }));

        let mut checker = Checker::new(oven.clone()).with_first_party_checker(first_party_checker);
        if let Some(authorizer) = params.authorizer {
            checker = checker.with_authorizer(authorizer);
        }
        if let Some(identity_client) = params.identity_client {
            checker = checker.with_identity_client(identity_client);
        }

        Bakery { oven, checker }
    }

    pub fn oven(&self) -> &Oven {
        &self.oven
    }

    pub fn checker(&self) -> &Checker {
        &self.checker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::Context;
    use crate::error;
    use crate::macaroon::LATEST_VERSION;
    use crate::op::Op;
    use time::{Duration, OffsetDateTime};

    #[test]
    fn mint_and_check() {
        let bakery = Bakery::new(BakeryParams {
            location: "here".to_string(),
            ..Default::default()
        });
        let read = Op::new("doc", "read");

        let m = bakery
            .oven()
            .macaroon(
                LATEST_VERSION,
                OffsetDateTime::now_utc() + Duration::minutes(5),
                &[],
                &[read.clone()],
            )
            .unwrap();
        assert_eq!(m.macaroon().location(), "here");

        let ctx = Context::new();
        let info = bakery
            .checker()
            .auth(vec![vec![m.macaroon().clone()]])
            .allow(&ctx, &[read])
            .unwrap();
        assert!(info.identity.is_none());
        assert_eq!(info.macaroons.len(), 1);

        let res = bakery
            .checker()
            .auth(vec![vec![m.into_macaroon()]])
            .allow(&ctx, &[Op::new("doc", "write")]);
        assert!(matches!(res, Err(error::Bakery::PermissionDenied(_))));
    }
}
