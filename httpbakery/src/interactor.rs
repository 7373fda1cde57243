//! interaction methods
//!
//! When a discharger needs the user to prove something before
//! discharging, it answers with an `interaction required` error listing
//! the interaction methods it supports. The client runs the first
//! [`Interactor`] it has for one of them, which returns a
//! [`DischargeToken`] sent along with the next discharge request.
//!
//! Old dischargers instead return a visit URL and a wait URL: the
//! interaction happens through the visit URL, then the discharge macaroon
//! is fetched from the wait URL.
use std::fmt;

use macaroon_bakery::{discharge_all, KeyPair, Macaroon};
use serde_json::{json, Value};
use tracing::info;
use url::Url;

use crate::client::{relative_url, Client};
use crate::error::{self, field, string_field, Error};

/// proof of an interaction, checked by the discharger
#[derive(Clone, PartialEq, Eq)]
pub struct DischargeToken {
    pub kind: String,
    pub value: Vec<u8>,
}

impl fmt::Debug for DischargeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DischargeToken")
            .field("kind", &self.kind)
            .finish()
    }
}

/// performs one kind of interaction
pub trait Interactor: Send + Sync {
    /// the interaction method kind this interactor implements
    fn kind(&self) -> &str;

    /// interacts with the discharger at `location`, which returned
    /// `error`, and returns the token to discharge with
    fn interact(
        &self,
        client: &Client,
        location: &str,
        error: &Error,
    ) -> Result<DischargeToken, error::Client>;

    /// the method kind to look for in the methods advertised by a legacy
    /// visit URL, `None` if legacy interaction is not supported
    fn legacy_kind(&self) -> Option<&str> {
        None
    }

    /// legacy interaction through `visit_url`; the client then waits for
    /// the discharge on the wait URL
    fn legacy_interact(
        &self,
        _client: &Client,
        _location: &str,
        _visit_url: &Url,
    ) -> Result<(), error::Client> {
        Err(error::Client::InteractionMethodNotFound(format!(
            "{} interactor does not support legacy interaction",
            self.kind()
        )))
    }
}

/// kind of [`WebBrowserInteractor`]
pub const BROWSER_WINDOW_KIND: &str = "browser-window";

/// legacy method kind of [`WebBrowserInteractor`]
pub const LEGACY_INTERACTIVE_KIND: &str = "interactive";

type OpenFn = Box<dyn Fn(&Url) -> Result<(), String> + Send + Sync>;

/// lets the user log in through a web page
///
/// the discharger advertises
/// `{"VisitURL": <url>, "WaitTokenURL": <url>}`: the visit URL is opened
/// for the user, and the wait token URL answers with the token once the
/// user is done
pub struct WebBrowserInteractor {
    open: OpenFn,
}

impl WebBrowserInteractor {
    /// `open` shows the given URL to the user
    pub fn new<F>(open: F) -> Self
    where
        F: Fn(&Url) -> Result<(), String> + Send + Sync + 'static,
    {
        WebBrowserInteractor {
            open: Box::new(open),
        }
    }

    fn open(&self, url: &Url) -> Result<(), error::Client> {
        (self.open)(url).map_err(|e| error::Client::Interaction(format!("cannot open {}: {}", url, e)))
    }
}

impl Default for WebBrowserInteractor {
    /// asks the user to open the page
    fn default() -> Self {
        WebBrowserInteractor::new(|url: &Url| {
            info!(%url, "waiting for the user to visit the login page");
            eprintln!("Please visit this URL to log in:\n{}", url);
            Ok(())
        })
    }
}

impl fmt::Debug for WebBrowserInteractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WebBrowserInteractor")
    }
}

impl Interactor for WebBrowserInteractor {
    fn kind(&self) -> &str {
        BROWSER_WINDOW_KIND
    }

    fn interact(
        &self,
        client: &Client,
        location: &str,
        error: &Error,
    ) -> Result<DischargeToken, error::Client> {
        let params = error
            .interaction_method(BROWSER_WINDOW_KIND)
            .and_then(Value::as_object)
            .ok_or_else(|| {
                error::Client::Interaction("invalid browser-window parameters".to_string())
            })?;
        let visit_url = string_field(params, "VisitURL")?
            .ok_or_else(|| error::Client::Interaction("no visit URL".to_string()))?;
        let wait_token_url = string_field(params, "WaitTokenURL")?
            .ok_or_else(|| error::Client::Interaction("no wait token URL".to_string()))?;

        self.open(&relative_url(location, &visit_url)?)?;
        wait_for_token(client, &relative_url(location, &wait_token_url)?)
    }

    fn legacy_kind(&self) -> Option<&str> {
        Some(LEGACY_INTERACTIVE_KIND)
    }

    fn legacy_interact(
        &self,
        _client: &Client,
        _location: &str,
        visit_url: &Url,
    ) -> Result<(), error::Client> {
        self.open(visit_url)
    }
}

/// waits for the token of a browser interaction
///
/// the response is `{"kind": <kind>, "token": <text>}`, or `token64` for
/// a binary token
fn wait_for_token(client: &Client, url: &Url) -> Result<DischargeToken, error::Client> {
    let body = client.get_json(url)?;
    let object = body
        .as_object()
        .ok_or_else(|| error::Client::Interaction("invalid wait token response".to_string()))?;

    let kind = string_field(object, "kind")?
        .ok_or_else(|| error::Client::Interaction("no kind in wait token response".to_string()))?;
    let value = match (string_field(object, "token")?, string_field(object, "token64")?) {
        (Some(token), _) => token.into_bytes(),
        (None, Some(token64)) => macaroon_bakery::format::b64decode(&token64)?,
        (None, None) => {
            return Err(error::Client::Interaction(
                "no token in wait token response".to_string(),
            ))
        }
    };
    Ok(DischargeToken { kind, value })
}

/// kind of [`AgentInteractor`]
pub const AGENT_KIND: &str = "agent";

/// an agent, logging in as `username` to the dischargers under `url`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Agent {
    pub url: String,
    pub username: String,
}

/// logs in non-interactively with a key pair
///
/// the discharger advertises `{"login-url": <url>}`. The agent gets a
/// macaroon from it for its user name and public key, discharges its
/// local third party caveat with the private key, and sends the result as
/// the token.
pub struct AgentInteractor {
    key: KeyPair,
    agents: Vec<Agent>,
}

impl AgentInteractor {
    pub fn new(key: KeyPair, agents: Vec<Agent>) -> Self {
        AgentInteractor { key, agents }
    }

    /// the agent with the longest URL prefixing `location`
    fn find_agent(&self, location: &str) -> Option<&Agent> {
        let location = location.trim_end_matches('/');
        self.agents
            .iter()
            .filter(|agent| {
                let url = agent.url.trim_end_matches('/');
                location == url
                    || location
                        .strip_prefix(url)
                        .map_or(false, |rest| rest.starts_with('/'))
            })
            .max_by_key(|agent| agent.url.trim_end_matches('/').len())
    }
}

impl fmt::Debug for AgentInteractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentInteractor")
            .field("public_key", &self.key.public())
            .field("agents", &self.agents)
            .finish()
    }
}

impl Interactor for AgentInteractor {
    fn kind(&self) -> &str {
        AGENT_KIND
    }

    fn interact(
        &self,
        client: &Client,
        location: &str,
        error: &Error,
    ) -> Result<DischargeToken, error::Client> {
        let agent = self.find_agent(location).ok_or_else(|| {
            error::Client::Interaction(format!("cannot find username for discharge location {}", location))
        })?;
        let login_url = error
            .interaction_method(AGENT_KIND)
            .and_then(Value::as_object)
            .and_then(|params| params.get("login-url"))
            .and_then(Value::as_str)
            .ok_or_else(|| error::Client::Interaction("no login-url in agent parameters".to_string()))?;

        let mut url = relative_url(location, login_url)?;
        url.query_pairs_mut()
            .append_pair("username", &agent.username)
            .append_pair("public-key", &self.key.public().to_base64());

        let body = client.get_json(&url)?;
        let m = body
            .as_object()
            .and_then(|object| field(object, "macaroon"))
            .cloned()
            .ok_or_else(|| error::Client::Interaction("no macaroon in agent login response".to_string()))?;
        let m = Macaroon::from_dict(m)?;

        let slice = discharge_all(
            &m,
            |_, _| -> Result<Macaroon, error::Client> {
                Err(error::Client::Interaction(
                    "unexpected third party caveat in agent login macaroon".to_string(),
                ))
            },
            Some(&self.key),
        )?;
        Ok(DischargeToken {
            kind: AGENT_KIND.to_string(),
            value: serde_json::to_vec(&slice)?,
        })
    }
}

/// the interaction parameters advertised for [`AgentInteractor`]
pub fn agent_interaction_params(login_url: &str) -> Value {
    json!({ "login-url": login_url })
}

/// the interaction parameters advertised for [`WebBrowserInteractor`]
pub fn browser_interaction_params(visit_url: &str, wait_token_url: &str) -> Value {
    json!({ "VisitURL": visit_url, "WaitTokenURL": wait_token_url })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_selection() {
        let interactor = AgentInteractor::new(
            KeyPair::new(),
            vec![
                Agent {
                    url: "https://ids.example.com".to_string(),
                    username: "root".to_string(),
                },
                Agent {
                    url: "https://ids.example.com/internal/".to_string(),
                    username: "internal".to_string(),
                },
            ],
        );
        let user = |location: &str| interactor.find_agent(location).map(|a| a.username.as_str());
        assert_eq!(user("https://ids.example.com"), Some("root"));
        assert_eq!(user("https://ids.example.com/public"), Some("root"));
        assert_eq!(user("https://ids.example.com/internal/x"), Some("internal"));
        assert_eq!(user("https://ids.example.com.evil"), None);
        assert_eq!(user("https://other.example.com"), None);
    }

    #[test]
    fn token_debug_hides_value() {
        let token = DischargeToken {
            kind: "agent".to_string(),
            value: b"secret".to_vec(),
        };
        assert!(!format!("{:?}", token).contains("secret"));
    }
}
