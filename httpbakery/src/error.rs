//! error types
//!
//! [`Error`] is the JSON error exchanged over HTTP by services and
//! dischargers, [`Client`] covers everything that can go wrong on the
//! client side of the protocol.
use std::collections::BTreeMap;
use std::fmt;

use http::StatusCode;
use macaroon_bakery::{error as bakery_error, Macaroon};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// error codes of the JSON error format
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadRequest,
    /// the client must discharge the macaroon in the error info and retry
    DischargeRequired,
    /// the discharger needs the user to interact before discharging
    InteractionRequired,
    InteractionMethodNotFound,
    PermissionDenied,
    /// any code not known to this library
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::BadRequest => "bad request",
            ErrorCode::DischargeRequired => "macaroon discharge required",
            ErrorCode::InteractionRequired => "interaction required",
            ErrorCode::InteractionMethodNotFound => "cannot find interaction method",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::Other(code) => code,
        }
    }

    pub fn parse(code: &str) -> Self {
        match code {
            "bad request" => ErrorCode::BadRequest,
            "macaroon discharge required" => ErrorCode::DischargeRequired,
            "interaction required" => ErrorCode::InteractionRequired,
            "cannot find interaction method" => ErrorCode::InteractionMethodNotFound,
            "permission denied" => ErrorCode::PermissionDenied,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    /// HTTP status of a response carrying an error with this code
    ///
    /// discharge required errors use 407 for old clients, see
    /// [`crate::discharge_required_response`]
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest | ErrorCode::InteractionMethodNotFound => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::DischargeRequired
            | ErrorCode::InteractionRequired
            | ErrorCode::PermissionDenied => StatusCode::UNAUTHORIZED,
            ErrorCode::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// additional information carried by an [`Error`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ErrorInfo {
    /// macaroon to discharge, for discharge required errors
    pub macaroon: Option<Macaroon>,
    /// path the discharged macaroon cookie applies to, relative to the
    /// request URL
    pub macaroon_path: Option<String>,
    /// suffix of the cookie name, `auth` when absent
    pub cookie_name_suffix: Option<String>,
    /// supported interaction methods by kind, for interaction required
    /// errors
    pub interaction_methods: Option<BTreeMap<String, Value>>,
    /// legacy interaction: URL the user should visit
    pub visit_url: Option<String>,
    /// legacy interaction: URL returning the discharge once the
    /// interaction is over
    pub wait_url: Option<String>,
}

impl ErrorInfo {
    fn is_empty(&self) -> bool {
        *self == ErrorInfo::default()
    }
}

/// the JSON error returned by services and dischargers
///
/// ```text
/// {"Code": "...", "Message": "...", "Info": {"Macaroon": ..., ...}}
/// ```
///
/// field names are matched case insensitively when parsing
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub info: ErrorInfo,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
            info: ErrorInfo::default(),
        }
    }

    /// an interaction required error without any method, add them with
    /// [`Error::with_interaction_method`]
    pub fn interaction_required(message: impl Into<String>) -> Self {
        Error::new(ErrorCode::InteractionRequired, message)
    }

    /// advertises an interaction method, `params` are specific to `kind`
    pub fn with_interaction_method(mut self, kind: &str, params: Value) -> Self {
        self.info
            .interaction_methods
            .get_or_insert_with(BTreeMap::new)
            .insert(kind.to_string(), params);
        self
    }

    /// parameters of the interaction method `kind`, if advertised
    pub fn interaction_method(&self, kind: &str) -> Option<&Value> {
        self.info
            .interaction_methods
            .as_ref()
            .and_then(|methods| methods.get(kind))
    }

    pub fn to_json(&self) -> Result<Value, bakery_error::Format> {
        let mut error = Map::new();
        if !self.message.is_empty() {
            error.insert("Message".to_string(), json!(self.message));
        }
        error.insert("Code".to_string(), json!(self.code.as_str()));

        if !self.info.is_empty() {
            let mut info = Map::new();
            if let Some(m) = &self.info.macaroon {
                info.insert("Macaroon".to_string(), m.to_dict()?);
            }
            if let Some(path) = &self.info.macaroon_path {
                info.insert("MacaroonPath".to_string(), json!(path));
            }
            if let Some(suffix) = &self.info.cookie_name_suffix {
                info.insert("CookieNameSuffix".to_string(), json!(suffix));
            }
            if let Some(methods) = &self.info.interaction_methods {
                info.insert("InteractionMethods".to_string(), json!(methods));
            }
            if let Some(url) = &self.info.visit_url {
                info.insert("VisitURL".to_string(), json!(url));
            }
            if let Some(url) = &self.info.wait_url {
                info.insert("WaitURL".to_string(), json!(url));
            }
            error.insert("Info".to_string(), Value::Object(info));
        }
        Ok(Value::Object(error))
    }

    pub fn from_json(value: &Value) -> Result<Self, Client> {
        let error = value
            .as_object()
            .ok_or_else(|| Client::Protocol("error is not a JSON object".to_string()))?;

        let code = match field(error, "Code") {
            Some(Value::String(code)) => ErrorCode::parse(code),
            Some(_) => return Err(Client::Protocol("error code is not a string".to_string())),
            None => ErrorCode::Other(String::new()),
        };
        let message = string_field(error, "Message")?.unwrap_or_default();

        let info = match field(error, "Info") {
            None | Some(Value::Null) => ErrorInfo::default(),
            Some(Value::Object(info)) => parse_info(info)?,
            Some(_) => return Err(Client::Protocol("error info is not an object".to_string())),
        };

        Ok(Error {
            code,
            message,
            info,
        })
    }
}

fn parse_info(info: &Map<String, Value>) -> Result<ErrorInfo, Client> {
    let macaroon = match field(info, "Macaroon") {
        None | Some(Value::Null) => None,
        Some(m) => Some(Macaroon::from_dict(m.clone())?),
    };
    let interaction_methods = match field(info, "InteractionMethods") {
        None | Some(Value::Null) => None,
        Some(Value::Object(methods)) => Some(
            methods
                .iter()
                .map(|(kind, params)| (kind.clone(), params.clone()))
                .collect(),
        ),
        Some(_) => {
            return Err(Client::Protocol(
                "interaction methods are not an object".to_string(),
            ))
        }
    };

    Ok(ErrorInfo {
        macaroon,
        macaroon_path: string_field(info, "MacaroonPath")?,
        cookie_name_suffix: string_field(info, "CookieNameSuffix")?,
        interaction_methods,
        visit_url: string_field(info, "VisitURL")?,
        wait_url: string_field(info, "WaitURL")?,
    })
}

/// looks up `name` ignoring ASCII case
pub(crate) fn field<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    object
        .get(name)
        .or_else(|| {
            object
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
}

pub(crate) fn string_field(
    object: &Map<String, Value>,
    name: &str,
) -> Result<Option<String>, Client> {
    match field(object, name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(Client::Protocol(format!("{} is not a string", name))),
    }
}

impl From<bakery_error::Bakery> for Error {
    fn from(e: bakery_error::Bakery) -> Self {
        let code = match &e {
            bakery_error::Bakery::PermissionDenied(_)
            | bakery_error::Bakery::ThirdPartyCaveatCheckFailed(_) => ErrorCode::PermissionDenied,
            bakery_error::Bakery::DischargeRequired(_) => ErrorCode::DischargeRequired,
            bakery_error::Bakery::Verification(_)
            | bakery_error::Bakery::CaveatNotRecognized(_)
            | bakery_error::Bakery::InvalidArgument(_)
            | bakery_error::Bakery::Format(_) => ErrorCode::BadRequest,
            _ => ErrorCode::Other("internal error".to_string()),
        };
        Error::new(code, e.to_string())
    }
}

/// client side errors
#[derive(Debug, Error)]
pub enum Client {
    #[error(transparent)]
    Bakery(#[from] bakery_error::Bakery),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    /// the discharger at `location` refused to discharge a caveat
    #[error("cannot acquire discharge from {location}: {error}")]
    Discharge { location: String, error: Error },
    /// the service returned an error that is not a discharge request
    #[error("remote error: {0}")]
    Remote(Error),
    #[error("interaction failed: {0}")]
    Interaction(String),
    #[error("cannot find interaction method: {0}")]
    InteractionMethodNotFound(String),
    #[error("too many ({0}) discharge requests")]
    TooManyRetries(u32),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("invalid URL: {0}")]
    Url(String),
}

impl Client {
    /// returns true if the same request can succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            Client::Bakery(e) => e.is_retryable(),
            Client::Transport(_) | Client::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<bakery_error::Format> for Client {
    fn from(e: bakery_error::Format) -> Self {
        Client::Bakery(e.into())
    }
}

impl From<serde_json::Error> for Client {
    fn from(e: serde_json::Error) -> Self {
        Client::Json(e.to_string())
    }
}

impl From<url::ParseError> for Client {
    fn from(e: url::ParseError) -> Self {
        Client::Url(e.to_string())
    }
}

impl From<http::Error> for Client {
    fn from(e: http::Error) -> Self {
        Client::Protocol(e.to_string())
    }
}
