//! authorization policies
use std::fmt;

use crate::checkers::{Caveat, Context};
use crate::error;
use crate::identity::{Identity, EVERYONE};
use crate::op::Op;

/// decides which operations an identity may perform
pub trait Authorizer: Send + Sync {
    /// returns, for each operation of `ops`, whether it is allowed, and
    /// the caveats to add to the macaroon authorizing the allowed ones
    ///
    /// `identity` is `None` when the request is not authenticated
    fn authorize(
        &self,
        ctx: &Context,
        identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), error::Bakery>;
}

/// denies every operation
#[derive(Clone, Copy, Debug, Default)]
pub struct ClosedAuthorizer;

impl Authorizer for ClosedAuthorizer {
    fn authorize(
        &self,
        _ctx: &Context,
        _identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), error::Bakery> {
        Ok((vec![false; ops.len()], Vec::new()))
    }
}

/// authorizes operations one by one with a function
///
/// the function can allow an operation on the condition that caveats are
/// added, for example a third party caveat requiring an identity
pub struct AuthorizerFunc<F> {
    f: F,
}

impl<F> AuthorizerFunc<F>
where
    F: Fn(&Context, Option<&dyn Identity>, &Op) -> Result<(bool, Vec<Caveat>), error::Bakery>
        + Send
        + Sync,
{
    pub fn new(f: F) -> Self {
        AuthorizerFunc { f }
    }
}

impl<F> fmt::Debug for AuthorizerFunc<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorizerFunc")
    }
}

impl<F> Authorizer for AuthorizerFunc<F>
where
    F: Fn(&Context, Option<&dyn Identity>, &Op) -> Result<(bool, Vec<Caveat>), error::Bakery>
        + Send
        + Sync,
{
    fn authorize(
        &self,
        ctx: &Context,
        identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), error::Bakery> {
        let mut allowed = Vec::with_capacity(ops.len());
        let mut caveats = Vec::new();
        for op in ops {
            let (ok, op_caveats) = (self.f)(ctx, identity, op)?;
            allowed.push(ok);
            caveats.extend(op_caveats);
        }
        Ok((allowed, caveats))
    }
}

/// authorizes operations with access control lists
///
/// identities that cannot be checked against ACLs are only allowed public
/// operations, the ones whose ACL contains [`EVERYONE`], and only if
/// `allow_public` is set
pub struct AclAuthorizer<F> {
    get_acl: F,
    allow_public: bool,
}

impl<F> AclAuthorizer<F>
where
    F: Fn(&Context, &Op) -> Result<Vec<String>, error::Bakery> + Send + Sync,
{
    pub fn new(get_acl: F, allow_public: bool) -> Self {
        AclAuthorizer {
            get_acl,
            allow_public,
        }
    }
}

impl<F> fmt::Debug for AclAuthorizer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AclAuthorizer")
            .field("allow_public", &self.allow_public)
            .finish()
    }
}

impl<F> Authorizer for AclAuthorizer<F>
where
    F: Fn(&Context, &Op) -> Result<Vec<String>, error::Bakery> + Send + Sync,
{
    fn authorize(
        &self,
        ctx: &Context,
        identity: Option<&dyn Identity>,
        ops: &[Op],
    ) -> Result<(Vec<bool>, Vec<Caveat>), error::Bakery> {
        let acl_identity = identity.and_then(|i| i.as_acl());
        let mut allowed = Vec::with_capacity(ops.len());
        for op in ops {
            let acl = (self.get_acl)(ctx, op)?;
            let ok = match acl_identity {
                Some(identity) => identity.allow(ctx, &acl)?,
                None => self.allow_public && acl.iter().any(|entry| entry == EVERYONE),
            };
            allowed.push(ok);
        }
        Ok((allowed, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SimpleIdentity;

    fn acl(_ctx: &Context, op: &Op) -> Result<Vec<String>, error::Bakery> {
        Ok(match op.entity() {
            "public" => vec![EVERYONE.to_string()],
            "bobs" => vec!["bob".to_string()],
            _ => vec![],
        })
    }

    #[test]
    fn closed() {
        let (allowed, caveats) = ClosedAuthorizer
            .authorize(&Context::new(), None, &[Op::new("a", "b"), Op::new("c", "d")])
            .unwrap();
        assert_eq!(allowed, vec![false, false]);
        assert!(caveats.is_empty());
    }

    #[test]
    fn acl_authorizer() {
        let ctx = Context::new();
        let ops = [
            Op::new("public", "read"),
            Op::new("bobs", "read"),
            Op::new("other", "read"),
        ];
        let bob = SimpleIdentity::new("bob");

        let auth = AclAuthorizer::new(acl, false);
        assert_eq!(
            auth.authorize(&ctx, Some(&bob), &ops).unwrap().0,
            vec![true, true, false]
        );
        assert_eq!(
            auth.authorize(&ctx, None, &ops).unwrap().0,
            vec![false, false, false]
        );

        let public = AclAuthorizer::new(acl, true);
        assert_eq!(
            public.authorize(&ctx, None, &ops).unwrap().0,
            vec![true, false, false]
        );
    }

    #[test]
    fn authorizer_func_collects_caveats() {
        let auth = AuthorizerFunc::new(|_ctx: &Context, _id: Option<&dyn Identity>, op: &Op| {
            if op.entity() == "e1" {
                Ok((
                    true,
                    vec![Caveat::third_party("ids", "is-authenticated-user")],
                ))
            } else {
                Ok((false, vec![]))
            }
        });
        let (allowed, caveats) = auth
            .authorize(&Context::new(), None, &[Op::new("e1", "read"), Op::new("e2", "read")])
            .unwrap();
        assert_eq!(allowed, vec![true, false]);
        assert_eq!(caveats.len(), 1);
    }
}
