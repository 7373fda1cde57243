//! operations, the unit of authorization
use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// an action performed on an entity
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Op {
    pub entity: Cow<'static, str>,
    pub action: Cow<'static, str>,
}

/// the operation used to establish an identity, without any resource
pub const LOGIN_OP: Op = Op {
    entity: Cow::Borrowed("login"),
    action: Cow::Borrowed("login"),
};

/// an operation that is always authorized, so that an identity can be
/// checked without requiring any macaroon
pub const NO_OP: Op = Op {
    entity: Cow::Borrowed(""),
    action: Cow::Borrowed(""),
};

impl Op {
    pub fn new(entity: impl Into<String>, action: impl Into<String>) -> Self {
        Op {
            entity: Cow::Owned(entity.into()),
            action: Cow::Owned(action.into()),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn action(&self) -> &str {
        &self.action
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.action)
    }
}

impl<E: Into<String>, A: Into<String>> From<(E, A)> for Op {
    fn from((entity, action): (E, A)) -> Self {
        Op::new(entity, action)
    }
}

/// sorts operations by entity then action and removes duplicates
pub fn canonical_ops(ops: &[Op]) -> Vec<Op> {
    let mut ops = ops.to_vec();
    ops.sort();
    ops.dedup();
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical() {
        let ops = vec![
            Op::new("e2", "read"),
            Op::new("e1", "write"),
            Op::new("e1", "read"),
            Op::new("e2", "read"),
        ];
        assert_eq!(
            canonical_ops(&ops),
            vec![
                Op::new("e1", "read"),
                Op::new("e1", "write"),
                Op::new("e2", "read"),
            ]
        );
        assert!(canonical_ops(&[]).is_empty());
    }

    #[test]
    fn sentinels() {
        assert_eq!(LOGIN_OP, Op::new("login", "login"));
        assert_eq!(NO_OP, Op::new("", ""));
        assert_eq!(Op::from(("e1", "read")).to_string(), "e1:read");
    }
}
