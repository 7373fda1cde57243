//! the HTTP client side of the discharge protocol
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE};
use http::{Method, Request, Response, StatusCode};
use macaroon_bakery::checkers::macaroons_expiry_time;
use macaroon_bakery::format::{raw_urlsafe_b64encode, RawCaveat};
use macaroon_bakery::{discharge_all, KeyPair, Macaroon, Slice, LATEST_VERSION};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::cookie::{
    cookie_header, encode_macaroons, Cookie, CookieJar, MemoryJar, COOKIE_PREFIX,
    DEFAULT_COOKIE_SUFFIX,
};
use crate::error::{self, field, Error, ErrorCode};
use crate::interactor::{DischargeToken, Interactor, LEGACY_INTERACTIVE_KIND};
use crate::protocol::{
    is_discharge_required, BAKERY_PROTOCOL_HEADER, DEFAULT_TIMEOUT, MAX_DISCHARGE_RETRIES,
};
use crate::transport::Transport;

/// client settings
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// discharge required responses followed for one request
    pub max_discharge_retries: u32,
    /// timeout of each HTTP call, used by the transports built by the
    /// client
    pub timeout: Duration,
    /// allows discharging caveats addressed to plain HTTP locations
    pub allow_insecure_locations: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_discharge_retries: MAX_DISCHARGE_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            allow_insecure_locations: false,
        }
    }
}

/// outcome of an interaction
enum Interaction {
    /// retry the discharge with this token
    Token(DischargeToken),
    /// a legacy interaction returned the discharge itself
    Discharge(Macaroon),
}

/// an HTTP client acquiring discharges when services ask for them
///
/// discharged macaroons are stored in the cookie jar and sent with the
/// following requests
pub struct Client {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    jar: Arc<dyn CookieJar>,
    interactors: Vec<Arc<dyn Interactor>>,
    key: Option<KeyPair>,
}

impl Client {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Client {
            transport: Arc::new(transport),
            config: ClientConfig::default(),
            jar: Arc::new(MemoryJar::new()),
            interactors: Vec::new(),
            key: None,
        }
    }

    /// a client sending requests with `reqwest`, with the timeout of
    /// `config`
    #[cfg(feature = "reqwest")]
    pub fn with_reqwest(config: ClientConfig) -> Result<Self, error::Client> {
        let transport = crate::transport::ReqwestTransport::with_timeout(config.timeout)?;
        Ok(Client::new(transport).with_config(config))
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.jar = jar;
        self
    }

    /// adds an interactor, tried in the order they were added
    pub fn with_interactor<I: Interactor + 'static>(mut self, interactor: I) -> Self {
        self.interactors.push(Arc::new(interactor));
        self
    }

    /// the key discharging local third party caveats
    pub fn with_key(mut self, key: KeyPair) -> Self {
        self.key = Some(key);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn jar(&self) -> &dyn CookieJar {
        self.jar.as_ref()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// sends `request`, discharging the macaroons the service asks for
    /// and retrying
    ///
    /// fails with [`error::Client::TooManyRetries`] when the service still
    /// asks for a discharge after `max_discharge_retries` discharges
    pub fn do_request(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, error::Client> {
        let (parts, body) = request.into_parts();
        let url = Url::parse(&parts.uri.to_string())?;

        let mut discharges = 0;
        loop {
            let mut request = Request::builder()
                .method(parts.method.clone())
                .uri(parts.uri.clone())
                .body(body.clone())?;
            *request.headers_mut() = parts.headers.clone();
            self.prepare(&url, request.headers_mut());

            let response = self.transport.round_trip(request)?;
            if !is_discharge_required(&response) {
                return Ok(response);
            }

            let error = parse_error(&response)?;
            if error.code != ErrorCode::DischargeRequired {
                return Err(error::Client::Remote(error));
            }
            if discharges >= self.config.max_discharge_retries {
                warn!(%url, discharges, "service keeps asking for discharges");
                return Err(error::Client::TooManyRetries(
                    self.config.max_discharge_retries,
                ));
            }
            discharges += 1;
            self.handle_error(&url, &error)?;
        }
    }

    /// adds the protocol version and the cookies of the jar
    fn prepare(&self, url: &Url, headers: &mut HeaderMap) {
        headers.insert(BAKERY_PROTOCOL_HEADER, HeaderValue::from(LATEST_VERSION));
        let cookies = self.jar.cookies(url);
        if cookies.is_empty() {
            return;
        }
        match HeaderValue::from_str(&cookie_header(&cookies)) {
            Ok(value) => {
                headers.append(COOKIE, value);
            }
            Err(e) => warn!(error = %e, "cannot send invalid cookies"),
        }
    }

    /// discharges the macaroon of a discharge required error returned for
    /// a request to `url`, and stores the result in the cookie jar
    pub fn handle_error(&self, url: &Url, error: &Error) -> Result<(), error::Client> {
        let m = error.info.macaroon.as_ref().ok_or_else(|| {
            error::Client::Protocol("no macaroon found in discharge required response".to_string())
        })?;
        let slice = self.discharge_all(m)?;

        let suffix = error
            .info
            .cookie_name_suffix
            .as_deref()
            .unwrap_or(DEFAULT_COOKIE_SUFFIX);
        let path = match &error.info.macaroon_path {
            Some(path) => url.join(path)?.path().to_string(),
            None => "/".to_string(),
        };
        let cookie = Cookie {
            name: format!("{}{}", COOKIE_PREFIX, suffix),
            value: encode_macaroons(&slice)?,
            path,
            expires: macaroons_expiry_time(m.namespace(), &slice),
        };
        debug!(%url, cookie = %cookie.name, path = %cookie.path, "storing discharged macaroon");
        self.jar.set_cookie(url, cookie);
        Ok(())
    }

    /// gathers the discharges of all the third party caveats of `m`
    pub fn discharge_all(&self, m: &Macaroon) -> Result<Slice, error::Client> {
        discharge_all(
            m,
            |caveat, payload| self.acquire_discharge(caveat, payload),
            self.key.as_ref(),
        )
    }

    /// gets a discharge for `caveat`, interacting when the discharger
    /// requires it
    pub fn acquire_discharge(
        &self,
        caveat: &RawCaveat,
        payload: Option<&[u8]>,
    ) -> Result<Macaroon, error::Client> {
        let location = caveat.location().ok_or_else(|| {
            error::Client::Protocol("third party caveat has no location".to_string())
        })?;

        match self.request_discharge(location, &caveat.id, payload, None) {
            Err(error::Client::Discharge { error, .. })
                if error.code == ErrorCode::InteractionRequired =>
            {
                match self.interact(location, &error)? {
                    Interaction::Token(token) => {
                        self.request_discharge(location, &caveat.id, payload, Some(&token))
                    }
                    Interaction::Discharge(m) => Ok(m),
                }
            }
            res => res,
        }
    }

    fn request_discharge(
        &self,
        location: &str,
        id: &[u8],
        payload: Option<&[u8]>,
        token: Option<&DischargeToken>,
    ) -> Result<Macaroon, error::Client> {
        let url = self.discharge_location(location)?;

        let mut form = url::form_urlencoded::Serializer::new(String::new());
        match std::str::from_utf8(id) {
            Ok(id) if !id.chars().any(char::is_control) => {
                form.append_pair("id", id);
            }
            _ => {
                form.append_pair("id64", &raw_urlsafe_b64encode(id));
            }
        }
        if let Some(payload) = payload {
            form.append_pair("caveat64", &raw_urlsafe_b64encode(payload));
        }
        if let Some(token) = token {
            form.append_pair("token64", &raw_urlsafe_b64encode(&token.value));
            form.append_pair("token-kind", &token.kind);
        }

        let request = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header(BAKERY_PROTOCOL_HEADER, LATEST_VERSION)
            .body(form.finish().into_bytes())?;
        let response = self.transport.round_trip(request)?;

        if response.status() != StatusCode::OK {
            let error = parse_error(&response)?;
            debug!(location, code = %error.code, "discharge refused");
            return Err(error::Client::Discharge {
                location: location.to_string(),
                error,
            });
        }
        let m = parse_macaroon(&serde_json::from_slice(response.body())?)?;
        debug!(location, "acquired discharge");
        Ok(m)
    }

    /// the discharge endpoint of a location
    fn discharge_location(&self, location: &str) -> Result<Url, error::Client> {
        let url = relative_url(location, "discharge")?;
        if url.scheme() != "https" && !self.config.allow_insecure_locations {
            return Err(error::Client::Url(format!(
                "untrusted discharge location {:?}",
                location
            )));
        }
        Ok(url)
    }

    fn interact(&self, location: &str, error: &Error) -> Result<Interaction, error::Client> {
        if let Some(methods) = &error.info.interaction_methods {
            for interactor in &self.interactors {
                if methods.contains_key(interactor.kind()) {
                    debug!(location, kind = interactor.kind(), "interacting");
                    let token = interactor.interact(self, location, error)?;
                    return Ok(Interaction::Token(token));
                }
            }
            return Err(error::Client::InteractionMethodNotFound(format!(
                "no supported interaction method among {:?}",
                methods.keys().collect::<Vec<_>>()
            )));
        }

        match (&error.info.visit_url, &error.info.wait_url) {
            (Some(visit_url), Some(wait_url)) => self
                .legacy_interact(location, visit_url, wait_url)
                .map(Interaction::Discharge),
            _ => Err(error::Client::Interaction(
                "interaction required but no interaction method or visit URL found".to_string(),
            )),
        }
    }

    fn legacy_interact(
        &self,
        location: &str,
        visit_url: &str,
        wait_url: &str,
    ) -> Result<Macaroon, error::Client> {
        let visit_url = relative_url(location, visit_url)?;
        let wait_url = relative_url(location, wait_url)?;
        let methods = self.legacy_methods(&visit_url);

        for interactor in &self.interactors {
            let url = match interactor.legacy_kind().and_then(|kind| methods.get(kind)) {
                Some(url) => relative_url(visit_url.as_str(), url)?,
                None => continue,
            };
            debug!(location, kind = interactor.kind(), "legacy interaction");
            interactor.legacy_interact(self, location, &url)?;

            let body = self.get_json(&wait_url)?;
            return parse_macaroon(&body);
        }
        Err(error::Client::InteractionMethodNotFound(format!(
            "no supported legacy interaction method among {:?}",
            methods.keys().collect::<Vec<_>>()
        )))
    }

    /// the methods a legacy visit URL supports, by kind
    ///
    /// dischargers that do not list them only support the `interactive`
    /// method, through the visit URL itself
    fn legacy_methods(&self, visit_url: &Url) -> BTreeMap<String, String> {
        let mut methods = BTreeMap::new();
        match self.get_json(visit_url) {
            Ok(Value::Object(object)) => {
                for (kind, url) in object {
                    if let Value::String(url) = url {
                        methods.insert(kind, url);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => debug!(url = %visit_url, error = %e, "cannot get legacy interaction methods"),
        }
        methods
            .entry(LEGACY_INTERACTIVE_KIND.to_string())
            .or_insert_with(|| visit_url.to_string());
        methods
    }

    /// sends a GET request expecting a JSON response
    ///
    /// non 200 responses are returned as [`error::Client::Interaction`]
    /// errors, with the message of the JSON error when there is one
    pub fn get_json(&self, url: &Url) -> Result<Value, error::Client> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header(BAKERY_PROTOCOL_HEADER, LATEST_VERSION)
            .body(Vec::new())?;
        let response = self.transport.round_trip(request)?;
        if response.status() != StatusCode::OK {
            let message = match parse_error(&response) {
                Ok(error) => error.message,
                Err(_) => String::new(),
            };
            return Err(error::Client::Interaction(format!(
                "GET {} returned status {}: {}",
                url,
                response.status(),
                message
            )));
        }
        Ok(serde_json::from_slice(response.body())?)
    }
}

/// resolves `target` relative to `base`, which is taken as a directory
pub fn relative_url(base: &str, target: &str) -> Result<Url, error::Client> {
    let base = if base.ends_with('/') {
        Url::parse(base)?
    } else {
        Url::parse(&format!("{}/", base))?
    };
    Ok(base.join(target)?)
}

fn parse_error(response: &Response<Vec<u8>>) -> Result<Error, error::Client> {
    let body: Value = serde_json::from_slice(response.body()).map_err(|e| {
        error::Client::Protocol(format!(
            "cannot parse error response with status {}: {}",
            response.status(),
            e
        ))
    })?;
    Error::from_json(&body)
}

/// parses `{"Macaroon": <macaroon>}`
fn parse_macaroon(body: &Value) -> Result<Macaroon, error::Client> {
    let m = body
        .as_object()
        .and_then(|object| field(object, "Macaroon"))
        .cloned()
        .ok_or_else(|| error::Client::Protocol("no macaroon in response".to_string()))?;
    Ok(Macaroon::from_dict(m)?)
}
