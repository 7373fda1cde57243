//! Macaroon bakery: authorization with macaroons and third party discharge
//!
//! A macaroon is a bearer token carrying a chain of caveats, each one
//! restricting what the token allows. Its signature is an HMAC chain
//! started from a root key only the issuing service knows, so anyone can
//! add caveats but nobody can remove them.
//!
//! This library adds on top of the raw macaroon format:
//!
//! * operations: macaroons are minted by an [Oven](`crate::Oven`) for a set
//!   of `entity:action` [operations](`crate::Op`), encoded in the macaroon id;
//! * third party caveats: a caveat can be addressed to another service, the
//!   discharger, by encrypting its condition and root key with the
//!   discharger's public key. The client then gets a discharge macaroon from
//!   that service and presents it alongside the first one;
//! * authorization: a [Checker](`crate::Checker`) checks the macaroons of a
//!   request against the operations it needs, and falls back to an
//!   [Authorizer](`crate::authorizer::Authorizer`) and an identity service
//!   when they do not grant them.
//!
//! # Usage
//!
//! A service mints a macaroon requiring a discharge from an authentication
//! service, the client collects the discharge and presents both:
//!
//! ```rust
//! use macaroon_bakery::{
//!     checkers::{Caveat, Context},
//!     discharge, discharge_all, error, Bakery, BakeryParams, KeyPair, Op,
//!     ThirdPartyCaveatCheckerFunc, ThirdPartyCaveatInfo, ThirdPartyInfo, ThirdPartyStore,
//!     LATEST_VERSION,
//! };
//! use std::sync::Arc;
//! use time::{Duration, OffsetDateTime};
//!
//! fn main() -> Result<(), error::Bakery> {
//!     // the authentication service and its public key
//!     let auth_key = KeyPair::new();
//!     let locator = ThirdPartyStore::new();
//!     locator.add_info(
//!         "https://auth.example.com",
//!         ThirdPartyInfo {
//!             public_key: auth_key.public(),
//!             version: LATEST_VERSION,
//!         },
//!     );
//!
//!     let bakery = Bakery::new(BakeryParams {
//!         location: "https://service.example.com".to_string(),
//!         key: Some(KeyPair::new()),
//!         locator: Some(Arc::new(locator)),
//!         ..Default::default()
//!     });
//!
//!     let read = Op::new("document", "read");
//!     let m = bakery.oven().macaroon(
//!         LATEST_VERSION,
//!         OffsetDateTime::now_utc() + Duration::hours(1),
//!         &[Caveat::third_party("https://auth.example.com", "is-authenticated")],
//!         &[read.clone()],
//!     )?;
//!
//!     // the authentication service accepts the condition
//!     let checker = ThirdPartyCaveatCheckerFunc(
//!         |_: &Context, info: &ThirdPartyCaveatInfo| -> Result<Vec<Caveat>, error::Bakery> {
//!             if info.condition == "is-authenticated" {
//!                 Ok(Vec::new())
//!             } else {
//!                 Err(error::Bakery::CaveatNotRecognized(info.condition.clone()))
//!             }
//!         },
//!     );
//!     let slice = discharge_all(
//!         &m,
//!         |caveat, payload| {
//!             discharge(&Context::new(), &caveat.id, payload, &auth_key, &checker, None)
//!         },
//!         None,
//!     )?;
//!
//!     let info = bakery
//!         .checker()
//!         .auth(vec![slice])
//!         .allow(&Context::new(), &[read])?;
//!     assert_eq!(info.macaroons.len(), 1);
//!     Ok(())
//! }
//! ```
mod crypto;

pub mod authorizer;
mod bakery;
pub mod checker;
pub mod checkers;
pub mod discharge;
pub mod error;
pub mod format;
pub mod identity;
pub mod macaroon;
pub mod op;
pub mod oven;
pub mod store;
pub mod third_party;

pub use crate::bakery::{Bakery, BakeryParams};
pub use checker::{AuthChecker, AuthInfo, Checker};
pub use crypto::{generate_root_key, KeyPair, PrivateKey, PublicKey};
pub use discharge::{
    discharge, discharge_all, ThirdPartyCaveatChecker, ThirdPartyCaveatCheckerFunc,
};
pub use macaroon::{
    Macaroon, Slice, LATEST_VERSION, LOCAL_LOCATION, VERSION_0, VERSION_1, VERSION_2, VERSION_3,
};
pub use op::{Op, LOGIN_OP, NO_OP};
pub use oven::{MacaroonOpStore, Oven, OvenParams};
pub use third_party::{
    local_third_party_caveat, ThirdPartyCaveatInfo, ThirdPartyInfo, ThirdPartyLocator,
    ThirdPartyStore,
};
