//! authenticated principals
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::checkers::{Caveat, Context};
use crate::error;

/// ACL entry matching any identity
pub const EVERYONE: &str = "everyone";

/// the principal behind a request
pub trait Identity: fmt::Debug + Send + Sync {
    /// unique id of the identity
    fn id(&self) -> &str;

    /// domain of the identity, empty when there is only one
    fn domain(&self) -> &str;

    /// returns the identity as an [`AclIdentity`] when it can be checked
    /// against ACLs
    fn as_acl(&self) -> Option<&dyn AclIdentity> {
        None
    }
}

/// an identity that can be checked against access control lists
pub trait AclIdentity: Identity {
    /// returns true if the identity is a member of one of the `acl` entries
    fn allow(&self, ctx: &Context, acl: &[String]) -> Result<bool, error::Bakery>;
}

/// a user name, allowed by ACLs that contain it or [`EVERYONE`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleIdentity(pub String);

impl SimpleIdentity {
    pub fn new(user: impl Into<String>) -> Self {
        SimpleIdentity(user.into())
    }
}

impl Identity for SimpleIdentity {
    fn id(&self) -> &str {
        &self.0
    }

    fn domain(&self) -> &str {
        ""
    }

    fn as_acl(&self) -> Option<&dyn AclIdentity> {
        Some(self)
    }
}

impl AclIdentity for SimpleIdentity {
    fn allow(&self, _ctx: &Context, acl: &[String]) -> Result<bool, error::Bakery> {
        Ok(acl.iter().any(|entry| entry == EVERYONE || *entry == self.0))
    }
}

/// finds the identity behind a request
pub trait IdentityClient: Send + Sync {
    /// returns the identity authenticated by the request itself, if any
    ///
    /// when there is none, the returned caveats are third party caveats
    /// whose discharge declares the identity
    fn identity_from_context(
        &self,
        ctx: &Context,
    ) -> Result<(Option<Arc<dyn Identity>>, Vec<Caveat>), error::Bakery>;

    /// returns the identity declared by the `declared` caveats of a
    /// discharge macaroon
    fn declared_identity(
        &self,
        ctx: &Context,
        declared: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Identity>, error::Bakery>;
}

/// an [`IdentityClient`] that never finds an identity
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIdentities;

impl IdentityClient for NoIdentities {
    fn identity_from_context(
        &self,
        _ctx: &Context,
    ) -> Result<(Option<Arc<dyn Identity>>, Vec<Caveat>), error::Bakery> {
        Ok((None, Vec::new()))
    }

    fn declared_identity(
        &self,
        _ctx: &Context,
        _declared: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Identity>, error::Bakery> {
        Err(error::Bakery::Identity(
            "no identity declared or possible".to_string(),
        ))
    }
}
