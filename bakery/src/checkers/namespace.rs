use std::collections::BTreeMap;

use super::{error_caveat, Caveat, STD_NAMESPACE};
use crate::error;

/// maps caveat namespace URIs to the short prefixes used in conditions
///
/// the namespace travels with version 3 macaroons so that a macaroon
/// checked by another service is interpreted with the same prefixes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Namespace {
    uri_to_prefix: BTreeMap<String, String>,
}

impl Namespace {
    pub fn new() -> Self {
        Namespace::default()
    }

    /// registers `prefix` for `uri`
    ///
    /// an already registered URI keeps its original prefix
    pub fn register(&mut self, uri: &str, prefix: &str) -> Result<(), error::Bakery> {
        if !is_valid_schema_uri(uri) {
            return Err(error::Bakery::InvalidArgument(format!(
                "cannot register invalid URI {:?} (prefix {:?})",
                uri, prefix
            )));
        }
        if !is_valid_prefix(prefix) {
            return Err(error::Bakery::InvalidArgument(format!(
                "cannot register invalid prefix {:?} for URI {:?}",
                prefix, uri
            )));
        }
        self.uri_to_prefix
            .entry(uri.to_string())
            .or_insert_with(|| prefix.to_string());
        Ok(())
    }

    /// prefix registered for `uri`
    pub fn resolve(&self, uri: &str) -> Option<&str> {
        self.uri_to_prefix.get(uri).map(String::as_str)
    }

    /// rewrites a first party caveat's condition with the prefix of its
    /// namespace, and clears the namespace
    ///
    /// third party caveats and caveats without a namespace are returned
    /// unchanged. A caveat in an unregistered namespace becomes an error
    /// caveat.
    pub fn resolve_caveat(&self, caveat: &Caveat) -> Caveat {
        let uri = match caveat.namespace() {
            Some(uri) if !caveat.is_third_party() => uri,
            _ => return caveat.clone(),
        };

        let (mut resolved, prefix) = match self.resolve(uri) {
            Some(prefix) => (caveat.clone(), prefix),
            None => {
                let err = error_caveat(&format!(
                    "caveat {:?} in unregistered namespace {:?}",
                    caveat.condition, uri
                ));
                let prefix = err
                    .namespace()
                    .and_then(|ns| self.resolve(ns))
                    .unwrap_or("");
                (err, prefix)
            }
        };
        resolved.condition = condition_with_prefix(prefix, &resolved.condition);
        resolved.namespace = None;
        resolved
    }

    /// space separated `uri:prefix` pairs, ordered by URI
    pub fn serialize_text(&self) -> String {
        self.uri_to_prefix
            .iter()
            .map(|(uri, prefix)| format!("{}:{}", uri, prefix))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// parses the output of [`Namespace::serialize_text`]
    pub fn deserialize_text(data: &str) -> Result<Self, error::Bakery> {
        let mut ns = Namespace::new();
        for entry in data.split(' ').filter(|e| !e.is_empty()) {
            let (uri, prefix) = entry.rsplit_once(':').ok_or_else(|| {
                error::Bakery::InvalidArgument(format!("no colon in namespace field {:?}", entry))
            })?;
            ns.register(uri, prefix)?;
        }
        Ok(ns)
    }

    pub fn is_empty(&self) -> bool {
        self.uri_to_prefix.is_empty()
    }
}

/// namespace assumed for macaroons that do not carry one
pub fn legacy_namespace() -> Namespace {
    let mut ns = Namespace::new();
    ns.uri_to_prefix
        .insert(STD_NAMESPACE.to_string(), String::new());
    ns
}

/// prepends `prefix:` to `condition`, unless the prefix is empty
pub fn condition_with_prefix(prefix: &str, condition: &str) -> String {
    if prefix.is_empty() {
        condition.to_string()
    } else {
        format!("{}:{}", prefix, condition)
    }
}

pub fn is_valid_schema_uri(uri: &str) -> bool {
    !uri.is_empty()
        && uri.len() <= 256
        && !uri.chars().any(|c| c.is_whitespace() || c.is_control())
}

pub fn is_valid_prefix(prefix: &str) -> bool {
    !prefix
        .chars()
        .any(|c| c == ':' || c.is_whitespace() || c.is_control())
}
