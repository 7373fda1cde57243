//! authorization of requests carrying macaroons
//!
//! An [`AuthChecker`] is created for every request from the macaroon
//! slices it carries. The slices are verified once, on the first check:
//! slices that do not verify are ignored, login macaroons whose
//! conditions hold provide the identity. Each operation is then
//! authorized by the first slice granting it whose first party conditions
//! hold, or by the [`Authorizer`].
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::authorizer::{Authorizer, ClosedAuthorizer};
use crate::checkers::{
    self, infer_declared_from_conditions, parse_caveat, time_before_caveat, Caveat, Context,
    FirstPartyCaveatChecker, Namespace, COND_ALLOW, COND_DECLARED, COND_DENY, COND_TIME_BEFORE,
};
use crate::error::{self, DischargeRequired};
use crate::identity::{Identity, IdentityClient, NoIdentities};
use crate::macaroon::Slice;
use crate::op::{Op, LOGIN_OP, NO_OP};
use crate::oven::MacaroonOpStore;

/// result of a successful authorization
#[derive(Clone, Debug)]
pub struct AuthInfo {
    /// the authenticated identity, `None` when the operations did not
    /// require one
    pub identity: Option<Arc<dyn Identity>>,
    /// the slices used to authorize the operations, in presentation order
    pub macaroons: Vec<Slice>,
}

/// checks requests against macaroons, an identity client and an
/// authorizer
#[derive(Clone)]
pub struct Checker {
    first_party_checker: Arc<dyn FirstPartyCaveatChecker>,
    authorizer: Arc<dyn Authorizer>,
    identity_client: Arc<dyn IdentityClient>,
    macaroon_op_store: Arc<dyn MacaroonOpStore>,
}

impl Checker {
    /// creates a checker denying everything not granted by a macaroon,
    /// with the standard first party checkers and no identities
    pub fn new(macaroon_op_store: Arc<dyn MacaroonOpStore>) -> Self {
        Checker {
            first_party_checker: Arc::new(checkers::Checker::new()),
            authorizer: Arc::new(ClosedAuthorizer),
            identity_client: Arc::new(NoIdentities),
            macaroon_op_store,
        }
    }

    pub fn with_first_party_checker(mut self, checker: Arc<dyn FirstPartyCaveatChecker>) -> Self {
        self.first_party_checker = checker;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_identity_client(mut self, identity_client: Arc<dyn IdentityClient>) -> Self {
        self.identity_client = identity_client;
        self
    }

    /// namespace of the first party checker
    pub fn namespace(&self) -> &Namespace {
        self.first_party_checker.namespace()
    }

    /// starts checking a request carrying `macaroons`
    pub fn auth(&self, macaroons: Vec<Slice>) -> AuthChecker<'_> {
        AuthChecker {
            parent: self,
            macaroons,
            state: None,
        }
    }
}

/// what the macaroons of a request prove, computed on the first check
struct InitState {
    identity: Option<Arc<dyn Identity>>,
    identity_caveats: Vec<Caveat>,
    /// slices granting each operation, in presentation order
    auth_indexes: HashMap<Op, Vec<usize>>,
    /// conditions of each slice, `None` for the slices that did not verify
    conditions: Vec<Option<Vec<String>>>,
    errors: Vec<String>,
}

/// authorizes operations for one request
pub struct AuthChecker<'a> {
    parent: &'a Checker,
    macaroons: Vec<Slice>,
    state: Option<InitState>,
}

impl<'a> AuthChecker<'a> {
    /// checks that all `ops` are authorized
    ///
    /// fails with [`error::Bakery::DischargeRequired`] when discharging a
    /// new macaroon could authorize them, and with
    /// [`error::Bakery::PermissionDenied`] otherwise
    pub fn allow(&mut self, ctx: &Context, ops: &[Op]) -> Result<AuthInfo, error::Bakery> {
        let (_, used) = self.allow_any_inner(ctx, ops, false)?;
        Ok(self.new_auth_info(&used))
    }

    /// like [`AuthChecker::allow`], but succeeds as soon as one of `ops`
    /// is authorized, returning which ones are
    ///
    /// [`error::Bakery::DischargeRequired`] is still returned when
    /// discharging could authorize the missing operations, and
    /// [`error::Bakery::PermissionDenied`] when none of them is authorized
    pub fn allow_any(
        &mut self,
        ctx: &Context,
        ops: &[Op],
    ) -> Result<(AuthInfo, Vec<bool>), error::Bakery> {
        let (authorized, used) = self.allow_any_inner(ctx, ops, true)?;
        Ok((self.new_auth_info(&used), authorized))
    }

    /// checks that `ops` are authorized and returns the first party
    /// conditions of the macaroons used, squashed so they can be added to
    /// a new capability macaroon
    ///
    /// time restrictions are merged into the earliest one, `allow`, `deny`
    /// and `declared` conditions are dropped since the capability carries
    /// its own operations
    pub fn allow_capability(
        &mut self,
        ctx: &Context,
        ops: &[Op],
    ) -> Result<Vec<Caveat>, error::Bakery> {
        if ops.iter().all(|op| *op == LOGIN_OP) {
            return Err(error::Bakery::InvalidArgument(
                "no non-login operations required in capability".to_string(),
            ));
        }

        let (_, used) = self.allow_any_inner(ctx, ops, false)?;
        let state = self.state()?;
        let mut squasher = CaveatSquasher::default();
        for (i, is_used) in used.iter().enumerate() {
            if !is_used {
                continue;
            }
            for condition in state.conditions[i].iter().flatten() {
                squasher.add(condition);
            }
        }
        Ok(squasher.finish())
    }

    fn new_auth_info(&self, used: &[bool]) -> AuthInfo {
        let identity = self.state.as_ref().and_then(|s| s.identity.clone());
        let macaroons = self
            .macaroons
            .iter()
            .zip(used)
            .filter(|(_, used)| **used)
            .map(|(m, _)| m.clone())
            .collect();
        AuthInfo {
            identity,
            macaroons,
        }
    }

    fn state(&self) -> Result<&InitState, error::Bakery> {
        self.state.as_ref().ok_or(error::Bakery::InternalError)
    }

    fn init(&mut self, ctx: &Context) -> Result<(), error::Bakery> {
        if self.state.is_none() {
            let state = self.init_state(ctx)?;
            self.state = Some(state);
        }
        Ok(())
    }

    fn init_state(&self, ctx: &Context) -> Result<InitState, error::Bakery> {
        let mut state = InitState {
            identity: None,
            identity_caveats: Vec::new(),
            auth_indexes: HashMap::new(),
            conditions: vec![None; self.macaroons.len()],
            errors: Vec::new(),
        };

        for (i, slice) in self.macaroons.iter().enumerate() {
            let (ops, conditions) = match self.parent.macaroon_op_store.macaroon_ops(slice) {
                Ok(res) => res,
                Err(error::Bakery::Verification(e)) => {
                    debug!(index = i, error = %e, "ignoring macaroon that does not verify");
                    state.errors.push(e);
                    continue;
                }
                Err(e) => return Err(error::Bakery::AuthInit(e.to_string())),
            };

            let mut is_login = false;
            for op in ops {
                if op == LOGIN_OP {
                    // only associated with the login operation once its
                    // conditions are checked below
                    is_login = true;
                } else {
                    state.auth_indexes.entry(op).or_default().push(i);
                }
            }

            if is_login {
                // the identity is decided once for the whole request, from
                // the first login macaroon whose conditions hold
                match self.check_conditions(ctx, &LOGIN_OP, &conditions) {
                    Err(e) => {
                        state
                            .errors
                            .push(format!("cannot authorize login macaroon: {}", e));
                    }
                    Ok(_) if state.identity.is_some() => {}
                    Ok(declared) => {
                        match self
                            .parent
                            .identity_client
                            .declared_identity(ctx, &declared)
                        {
                            Ok(identity) => {
                                state.auth_indexes.entry(LOGIN_OP).or_default().push(i);
                                state.identity = Some(identity);
                            }
                            Err(error::Bakery::Identity(e)) => {
                                state
                                    .errors
                                    .push(format!("cannot decode declared identity: {}", e));
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
            state.conditions[i] = Some(conditions);
        }

        if state.identity.is_none() {
            match self.parent.identity_client.identity_from_context(ctx) {
                Ok((identity, caveats)) => {
                    state.identity = identity;
                    state.identity_caveats = caveats;
                }
                Err(e) => {
                    debug!(error = %e, "could not determine identity from context");
                    state.errors.push("could not determine identity".to_string());
                }
            }
        }

        Ok(state)
    }

    /// returns which of `ops` are authorized and which slices were used
    ///
    /// with `partial`, operations that cannot be authorized are reported
    /// as such instead of failing, provided another one is authorized
    fn allow_any_inner(
        &mut self,
        ctx: &Context,
        ops: &[Op],
        partial: bool,
    ) -> Result<(Vec<bool>, Vec<bool>), error::Bakery> {
        self.init(ctx)?;
        let state = self.state()?;

        let mut used = vec![false; self.macaroons.len()];
        let mut authorized = vec![false; ops.len()];
        let mut errors = Vec::new();

        for (i, op) in ops.iter().enumerate() {
            if *op == NO_OP {
                authorized[i] = true;
                continue;
            }
            for &index in state.auth_indexes.get(op).into_iter().flatten() {
                let conditions = match &state.conditions[index] {
                    Some(conditions) => conditions,
                    None => continue,
                };
                match self.check_conditions(ctx, op, conditions) {
                    Ok(_) => {
                        authorized[i] = true;
                        used[index] = true;
                        break;
                    }
                    Err(e) => errors.push(e),
                }
            }
            // an authenticated identity is enough for the login operation
            if *op == LOGIN_OP && !authorized[i] && state.identity.is_some() {
                authorized[i] = true;
            }
        }

        if state.identity.is_some() {
            // the login macaroon conditions were checked during init
            for &index in state.auth_indexes.get(&LOGIN_OP).into_iter().flatten() {
                used[index] = true;
            }
        }

        let need_index: Vec<usize> = (0..ops.len()).filter(|i| !authorized[*i]).collect();
        if need_index.is_empty() {
            return Ok((authorized, used));
        }
        let need: Vec<Op> = need_index.iter().map(|i| ops[*i].clone()).collect();

        // the authorizer is asked even without an identity
        let (oks, caveats) =
            self.parent
                .authorizer
                .authorize(ctx, state.identity.as_deref(), &need)?;

        let mut still_need = Vec::new();
        for (j, &i) in need_index.iter().enumerate() {
            if oks.get(j).copied().unwrap_or(false) {
                authorized[i] = true;
            } else {
                still_need.push(ops[i].clone());
            }
        }

        if still_need.is_empty() && caveats.is_empty() {
            return Ok((authorized, used));
        }

        if state.identity.is_none() && !state.identity_caveats.is_empty() {
            return Err(DischargeRequired {
                message: "authentication required".to_string(),
                ops: vec![LOGIN_OP],
                caveats: state.identity_caveats.clone(),
                for_authentication: true,
            }
            .into());
        }

        if caveats.is_empty() {
            if partial && authorized.iter().any(|ok| *ok) {
                debug!(ops = ?still_need, "operations not authorized");
                return Ok((authorized, used));
            }
            let message = state
                .errors
                .iter()
                .chain(errors.iter())
                .next()
                .cloned()
                .unwrap_or_else(|| {
                    let ops: Vec<String> = still_need.iter().map(Op::to_string).collect();
                    format!("{} not authorized", ops.join(", "))
                });
            debug!(ops = ?still_need, "permission denied");
            return Err(error::Bakery::PermissionDenied(message));
        }

        Err(DischargeRequired {
            message: "some operations have extra caveats".to_string(),
            ops: ops.to_vec(),
            caveats,
            for_authentication: false,
        }
        .into())
    }

    /// checks `conditions` for `op`, returns the attributes they declare
    fn check_conditions(
        &self,
        ctx: &Context,
        op: &Op,
        conditions: &[String],
    ) -> Result<BTreeMap<String, String>, String> {
        let declared = infer_declared_from_conditions(conditions, self.parent.namespace());
        let ctx = ctx
            .clone()
            .with_operations([op.action.to_string()])
            .with_declared(declared.clone());
        for condition in conditions {
            self.parent
                .first_party_checker
                .check_first_party_caveat(&ctx, condition)?;
        }
        Ok(declared)
    }
}

/// merges the first party conditions of several macaroons
#[derive(Default)]
struct CaveatSquasher {
    expiry: Option<OffsetDateTime>,
    conditions: Vec<String>,
}

impl CaveatSquasher {
    fn add(&mut self, condition: &str) {
        let (name, arg) = match parse_caveat(condition) {
            Ok(parsed) => parsed,
            // kept as is when it cannot be interpreted
            Err(_) => {
                self.conditions.push(condition.to_string());
                return;
            }
        };
        match name {
            COND_TIME_BEFORE => match OffsetDateTime::parse(arg, &Rfc3339) {
                Ok(t) => {
                    if self.expiry.map_or(true, |expiry| t < expiry) {
                        self.expiry = Some(t);
                    }
                }
                Err(_) => self.conditions.push(condition.to_string()),
            },
            COND_ALLOW | COND_DENY | COND_DECLARED => {}
            _ => self.conditions.push(condition.to_string()),
        }
    }

    /// sorted and deduplicated conditions
    fn finish(mut self) -> Vec<Caveat> {
        if let Some(expiry) = self.expiry {
            self.conditions.push(time_before_caveat(expiry).condition);
        }
        self.conditions.sort();
        self.conditions.dedup();
        self.conditions.into_iter().map(Caveat::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squash() {
        let mut squasher = CaveatSquasher::default();
        for c in [
            "time-before 2030-01-01T00:00:00Z",
            "allow read",
            "declared username bob",
            "other thing",
            "time-before 2020-01-01T00:00:00Z",
            "other thing",
            "deny write",
            "time-before 2025-01-01T00:00:00Z",
        ] {
            squasher.add(c);
        }
        assert_eq!(
            squasher.finish(),
            vec![
                Caveat::new("other thing"),
                Caveat::new("time-before 2020-01-01T00:00:00Z"),
            ]
        );
    }

    #[test]
    fn squash_keeps_unparsable() {
        let mut squasher = CaveatSquasher::default();
        squasher.add(" leading space");
        squasher.add("time-before never");
        assert_eq!(
            squasher.finish(),
            vec![Caveat::new(" leading space"), Caveat::new("time-before never")]
        );
    }
}
