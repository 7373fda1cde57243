use std::collections::{BTreeMap, BTreeSet};

use super::{condition_with_prefix, parse_caveat, Namespace, COND_DECLARED, STD_NAMESPACE};

/// collects the attributes declared by `declared` caveats in `conditions`
///
/// a key declared with two different values is dropped, so that a
/// conflicting declaration never satisfies a checker
pub fn infer_declared_from_conditions<S: AsRef<str>>(
    conditions: &[S],
    ns: &Namespace,
) -> BTreeMap<String, String> {
    let declared_cond = match ns.resolve(STD_NAMESPACE) {
        Some(prefix) => condition_with_prefix(prefix, COND_DECLARED),
        None => return BTreeMap::new(),
    };

    let mut info = BTreeMap::new();
    let mut conflicts = BTreeSet::new();
    for condition in conditions {
        let (name, arg) = match parse_caveat(condition.as_ref()) {
            Ok(parsed) => parsed,
            Err(_) => continue,
        };
        if name != declared_cond {
            continue;
        }
        let (key, value) = match arg.split_once(' ') {
            Some((key, value)) => (key, value),
            None => (arg, ""),
        };
        if key.is_empty() {
            continue;
        }
        match info.get(key) {
            Some(old) if old != value => {
                conflicts.insert(key.to_string());
            }
            Some(_) => {}
            None => {
                info.insert(key.to_string(), value.to_string());
            }
        }
    }

    for key in conflicts {
        info.remove(&key);
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::legacy_namespace;

    #[test]
    fn infer_declared() {
        let ns = legacy_namespace();
        let declared = infer_declared_from_conditions(
            &[
                "declared username bob",
                "declared group admins",
                "declared group users",
                "declared domain example.com",
                "declared domain example.com",
                "declared empty",
                "allow read",
                "other:declared foo bar",
            ],
            &ns,
        );

        let expected: BTreeMap<String, String> = [
            ("username", "bob"),
            ("domain", "example.com"),
            ("empty", ""),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(declared, expected);
    }

    #[test]
    fn unknown_std_namespace() {
        let declared = infer_declared_from_conditions(&["declared username bob"], &Namespace::new());
        assert!(declared.is_empty());
    }
}
