//! first party caveats and their checkers
//!
//! A first party caveat is a condition string of the form `name argument`,
//! where `name` may carry a namespace prefix (`prefix:name`). The standard
//! namespace (`std`) is registered with an empty prefix, so its conditions
//! are written without one:
//!
//! - `declared <key> <value>`: the attribute `key` has the given value
//! - `time-before <rfc3339 time>`: the macaroon expires at that time
//! - `allow <action>...`: only the listed actions are allowed
//! - `deny <action>...`: the listed actions are denied
//! - `error <message>`: the caveat can never be satisfied
//! - `need-declared <key,...> <condition>`: a third party caveat whose
//!   discharge must declare the listed attributes
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod checker;
mod declared;
mod namespace;
mod time_caveat;

pub use checker::{CheckFn, Checker, CheckerInfo, FirstPartyCaveatChecker};
pub use declared::infer_declared_from_conditions;
pub use namespace::{
    condition_with_prefix, is_valid_prefix, is_valid_schema_uri, legacy_namespace, Namespace,
};
pub use time_caveat::{expiry_time, macaroons_expiry_time, time_before_caveat};

/// URI of the standard caveat namespace
pub const STD_NAMESPACE: &str = "std";

pub const COND_DECLARED: &str = "declared";
pub const COND_TIME_BEFORE: &str = "time-before";
pub const COND_ERROR: &str = "error";
pub const COND_ALLOW: &str = "allow";
pub const COND_DENY: &str = "deny";
pub const COND_NEED_DECLARED: &str = "need-declared";

/// a caveat before it is added to a macaroon
///
/// a caveat with a non-empty location is a third party caveat, the
/// condition is then interpreted by the discharger at that location
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Caveat {
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Caveat {
    /// creates a first party caveat with no namespace
    pub fn new(condition: impl Into<String>) -> Self {
        Caveat {
            condition: condition.into(),
            location: None,
            namespace: None,
        }
    }

    /// creates a third party caveat
    pub fn third_party(location: impl Into<String>, condition: impl Into<String>) -> Self {
        Caveat {
            condition: condition.into(),
            location: Some(location.into()),
            namespace: None,
        }
    }

    /// the location, treating an empty one as absent
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref().filter(|l| !l.is_empty())
    }

    /// the namespace URI, treating an empty one as absent
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|n| !n.is_empty())
    }

    pub fn is_third_party(&self) -> bool {
        self.location().is_some()
    }
}

impl fmt::Display for Caveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location() {
            Some(location) => write!(f, "{} (at {})", self.condition, location),
            None => write!(f, "{}", self.condition),
        }
    }
}

/// splits a condition into its name and argument
///
/// ```rust
/// use macaroon_bakery::checkers::parse_caveat;
///
/// assert_eq!(parse_caveat("allow read write").unwrap(), ("allow", "read write"));
/// assert_eq!(parse_caveat("true").unwrap(), ("true", ""));
/// assert!(parse_caveat(" allow").is_err());
/// ```
pub fn parse_caveat(caveat: &str) -> Result<(&str, &str), String> {
    if caveat.is_empty() {
        return Err("empty caveat".to_string());
    }
    match caveat.find(' ') {
        None => Ok((caveat, "")),
        Some(0) => Err("caveat starts with space character".to_string()),
        Some(i) => Ok((&caveat[..i], &caveat[i + 1..])),
    }
}

fn first_party(name: &str, arg: &str) -> Caveat {
    let condition = if arg.is_empty() {
        name.to_string()
    } else {
        format!("{} {}", name, arg)
    };
    Caveat {
        condition,
        location: None,
        namespace: Some(STD_NAMESPACE.to_string()),
    }
}

/// a caveat that declares the attribute `key` with `value`
///
/// an invalid key produces an error caveat
pub fn declared_caveat(key: &str, value: &str) -> Caveat {
    if key.is_empty() || key.contains(' ') {
        return error_caveat(&format!("invalid caveat 'declared' key \"{}\"", key));
    }
    first_party(COND_DECLARED, &format!("{} {}", key, value))
}

/// a caveat that always fails with `message`
pub fn error_caveat(message: &str) -> Caveat {
    first_party(COND_ERROR, message)
}

/// a caveat restricting the macaroon to the given actions
pub fn allow_caveat<S: AsRef<str>>(ops: &[S]) -> Caveat {
    if ops.is_empty() {
        return error_caveat("no operations allowed");
    }
    operation_caveat(COND_ALLOW, ops)
}

/// a caveat denying the given actions
pub fn deny_caveat<S: AsRef<str>>(ops: &[S]) -> Caveat {
    operation_caveat(COND_DENY, ops)
}

fn operation_caveat<S: AsRef<str>>(cond: &str, ops: &[S]) -> Caveat {
    for op in ops {
        if op.as_ref().contains(' ') {
            return error_caveat(&format!("invalid operation name \"{}\"", op.as_ref()));
        }
    }
    let ops: Vec<&str> = ops.iter().map(AsRef::as_ref).collect();
    first_party(cond, &ops.join(" "))
}

/// wraps a third party caveat so that its discharge must declare `keys`
pub fn need_declared_caveat<S: AsRef<str>>(caveat: &Caveat, keys: &[S]) -> Caveat {
    let location = match caveat.location() {
        Some(location) => location,
        None => return error_caveat("need-declared caveat is not third-party"),
    };
    let keys: Vec<&str> = keys.iter().map(AsRef::as_ref).collect();
    Caveat {
        condition: format!("{} {} {}", COND_NEED_DECLARED, keys.join(","), caveat.condition),
        location: Some(location.to_string()),
        namespace: caveat.namespace.clone(),
    }
}

/// request-scoped information used by caveat checkers
#[derive(Clone, Debug, Default)]
pub struct Context {
    now: Option<OffsetDateTime>,
    declared: BTreeMap<String, String>,
    operations: Vec<String>,
    values: BTreeMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    /// fixes the time seen by `time-before` checks
    pub fn with_time(mut self, now: OffsetDateTime) -> Self {
        self.now = Some(now);
        self
    }

    /// current time, or the time set with [`Context::with_time`]
    pub fn now(&self) -> OffsetDateTime {
        self.now.unwrap_or_else(OffsetDateTime::now_utc)
    }

    pub fn with_declared(mut self, declared: BTreeMap<String, String>) -> Self {
        self.declared = declared;
        self
    }

    pub fn declared(&self) -> &BTreeMap<String, String> {
        &self.declared
    }

    /// sets the actions checked by `allow` and `deny` caveats
    pub fn with_operations<S: Into<String>>(mut self, ops: impl IntoIterator<Item = S>) -> Self {
        self.operations = ops.into_iter().map(Into::into).collect();
        self
    }

    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    /// attaches an application defined value, like the authenticated user
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caveat_constructors() {
        assert_eq!(
            declared_caveat("username", "bob").condition,
            "declared username bob"
        );
        assert_eq!(
            declared_caveat("user name", "bob").condition,
            "error invalid caveat 'declared' key \"user name\""
        );
        assert_eq!(allow_caveat(&["read", "write"]).condition, "allow read write");
        assert_eq!(
            allow_caveat::<&str>(&[]).condition,
            "error no operations allowed"
        );
        assert_eq!(deny_caveat(&["write"]).condition, "deny write");
        assert_eq!(
            deny_caveat(&["bad op"]).condition,
            "error invalid operation name \"bad op\""
        );
        assert_eq!(
            allow_caveat(&["read"]).namespace.as_deref(),
            Some(STD_NAMESPACE)
        );
    }

    #[test]
    fn need_declared() {
        let cav = Caveat::third_party("https://ids", "is-authenticated-user");
        let need = need_declared_caveat(&cav, &["username", "groups"]);
        assert_eq!(
            need.condition,
            "need-declared username,groups is-authenticated-user"
        );
        assert_eq!(need.location(), Some("https://ids"));

        let first = need_declared_caveat(&Caveat::new("true"), &["username"]);
        assert_eq!(
            first.condition,
            "error need-declared caveat is not third-party"
        );
    }

    #[test]
    fn parse() {
        assert_eq!(parse_caveat("a b c").unwrap(), ("a", "b c"));
        assert_eq!(parse_caveat("a").unwrap(), ("a", ""));
        assert!(parse_caveat("").is_err());
        assert!(parse_caveat(" a").is_err());
    }

    #[test]
    fn empty_location_is_first_party() {
        let cav = Caveat {
            condition: "true".to_string(),
            location: Some(String::new()),
            namespace: None,
        };
        assert!(!cav.is_third_party());
    }
}
