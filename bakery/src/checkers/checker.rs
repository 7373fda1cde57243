use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{
    condition_with_prefix, parse_caveat, Context, Namespace, COND_ALLOW, COND_DECLARED,
    COND_DENY, COND_ERROR, COND_TIME_BEFORE, STD_NAMESPACE,
};
use crate::error;

/// checks one condition, called with the full condition name and its
/// argument
pub type CheckFn = Arc<dyn Fn(&Context, &str, &str) -> Result<(), String> + Send + Sync>;

/// checks first party caveats found in macaroons
pub trait FirstPartyCaveatChecker: Send + Sync {
    /// returns an error message if `caveat` does not hold in `ctx`
    fn check_first_party_caveat(&self, ctx: &Context, caveat: &str) -> Result<(), String>;

    /// the namespace of all the conditions understood by this checker
    fn namespace(&self) -> &Namespace;
}

/// a registered condition checker
#[derive(Clone)]
pub struct CheckerInfo {
    pub prefix: String,
    pub name: String,
    pub namespace: String,
    pub check: CheckFn,
}

impl fmt::Debug for CheckerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckerInfo")
            .field("prefix", &self.prefix)
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// registry of first party condition checkers
#[derive(Clone, Debug)]
pub struct Checker {
    namespace: Namespace,
    checkers: BTreeMap<String, CheckerInfo>,
}

impl Checker {
    /// creates a checker with the standard conditions registered
    pub fn new() -> Self {
        let mut checker = Checker::empty(Namespace::new());
        checker.register_std();
        checker
    }

    /// creates a checker without any condition
    pub fn empty(namespace: Namespace) -> Self {
        Checker {
            namespace,
            checkers: BTreeMap::new(),
        }
    }

    /// registers `check` for the condition `cond` in the namespace `uri`
    ///
    /// the namespace must already have a prefix
    pub fn register<F>(&mut self, cond: &str, uri: &str, check: F) -> Result<(), error::Bakery>
    where
        F: Fn(&Context, &str, &str) -> Result<(), String> + Send + Sync + 'static,
    {
        let prefix = self.namespace.resolve(uri).ok_or_else(|| {
            error::Bakery::InvalidArgument(format!(
                "no prefix registered for namespace {} when registering condition {}",
                uri, cond
            ))
        })?;
        if prefix.is_empty() && cond.contains(':') {
            return Err(error::Bakery::InvalidArgument(format!(
                "caveat condition {} in namespace {} contains a colon but its prefix is empty",
                cond, uri
            )));
        }

        let full_condition = condition_with_prefix(prefix, cond);
        if let Some(info) = self.checkers.get(&full_condition) {
            return Err(error::Bakery::InvalidArgument(format!(
                "checker for {} (namespace {}) already registered in namespace {}",
                full_condition, uri, info.namespace
            )));
        }

        let info = CheckerInfo {
            prefix: prefix.to_string(),
            name: cond.to_string(),
            namespace: uri.to_string(),
            check: Arc::new(check),
        };
        self.checkers.insert(full_condition, info);
        Ok(())
    }

    /// registers the conditions of the standard namespace
    pub fn register_std(&mut self) {
        // the std namespace is always a valid registration
        let _ = self.namespace.register(STD_NAMESPACE, "");

        let std_checkers: [(&str, fn(&Context, &str, &str) -> Result<(), String>); 5] = [
            (COND_DECLARED, check_declared),
            (COND_TIME_BEFORE, check_time_before),
            (COND_ERROR, check_error),
            (COND_ALLOW, check_allow),
            (COND_DENY, check_deny),
        ];
        for (cond, check) in std_checkers {
            // already registered conditions are kept
            let _ = self.register(cond, STD_NAMESPACE, check);
        }
    }

    /// all registered checkers, ordered by namespace then name
    pub fn info(&self) -> Vec<CheckerInfo> {
        let mut infos: Vec<CheckerInfo> = self.checkers.values().cloned().collect();
        infos.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        infos
    }
}

impl Default for Checker {
    fn default() -> Self {
        Checker::new()
    }
}

impl FirstPartyCaveatChecker for Checker {
    fn check_first_party_caveat(&self, ctx: &Context, caveat: &str) -> Result<(), String> {
        let (cond, arg) =
            parse_caveat(caveat).map_err(|e| format!("cannot parse caveat {:?}: {}", caveat, e))?;
        let info = self.checkers.get(cond).ok_or_else(|| {
            format!(
                "caveat {:?} not satisfied: caveat not recognized",
                caveat
            )
        })?;
        (info.check)(ctx, cond, arg)
            .map_err(|e| format!("caveat {:?} not satisfied: {}", caveat, e))
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }
}

fn check_declared(ctx: &Context, _cond: &str, arg: &str) -> Result<(), String> {
    let (key, expected) = arg
        .split_once(' ')
        .ok_or_else(|| "declared caveat has no value".to_string())?;
    match ctx.declared().get(key) {
        None => Err(format!("got {}=null, expected {:?}", key, expected)),
        Some(value) if value != expected => {
            Err(format!("got {}={:?}, expected {:?}", key, value, expected))
        }
        Some(_) => Ok(()),
    }
}

fn check_time_before(ctx: &Context, _cond: &str, arg: &str) -> Result<(), String> {
    let expiry = OffsetDateTime::parse(arg, &Rfc3339)
        .map_err(|_| format!("cannot parse {:?} as RFC 3339", arg))?;
    if ctx.now() >= expiry {
        return Err("macaroon has expired".to_string());
    }
    Ok(())
}

fn check_error(_ctx: &Context, _cond: &str, arg: &str) -> Result<(), String> {
    Err(arg.to_string())
}

fn check_allow(ctx: &Context, _cond: &str, arg: &str) -> Result<(), String> {
    check_operations(ctx, true, arg)
}

fn check_deny(ctx: &Context, _cond: &str, arg: &str) -> Result<(), String> {
    check_operations(ctx, false, arg)
}

/// checks an allow or deny caveat, `need_ops` is true when every action
/// of the context must be listed in the caveat
fn check_operations(ctx: &Context, need_ops: bool, arg: &str) -> Result<(), String> {
    let fields: Vec<&str> = arg.split_whitespace().collect();
    let ctx_ops = ctx.operations();
    if ctx_ops.is_empty() {
        if need_ops {
            return match fields.first() {
                None => Err("no operations allowed".to_string()),
                Some(op) => Err(format!("{} not allowed", op)),
            };
        }
        return Ok(());
    }

    for op in ctx_ops {
        let found = fields.iter().any(|f| f == op);
        if found != need_ops {
            return Err(format!("{} not allowed", op));
        }
    }
    Ok(())
}
