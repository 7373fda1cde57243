//! the HTTP side of a third party discharger
//!
//! [`DischargeHandler`] serves the endpoints clients use to discharge
//! third party caveats:
//!
//! * `GET /discharge/info`: the public key and bakery version of the
//!   discharger;
//! * `GET /publickey`: the public key alone, for old clients;
//! * `POST /discharge`: the discharge itself, from a form carrying the
//!   caveat id (`id` or `id64`), the caveat payload (`caveat64`) and the
//!   token of a previous interaction (`token` or `token64`, with
//!   `token-kind`).
use std::sync::Arc;

use http::{Method, Request, Response, StatusCode};
use macaroon_bakery::checkers::{Caveat, Context};
use macaroon_bakery::format::{b64decode, raw_urlsafe_b64encode};
use macaroon_bakery::{
    discharge, error as bakery_error, KeyPair, PublicKey, ThirdPartyCaveatChecker,
    ThirdPartyCaveatInfo, ThirdPartyLocator, LATEST_VERSION,
};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{Error, ErrorCode};
use crate::interactor::DischargeToken;
use crate::protocol::{error_response, json_response};

const TOKEN_KIND_VALUE: &str = "discharge-token-kind";
const TOKEN_VALUE: &str = "discharge-token";

/// a [`ThirdPartyCaveatChecker`] implemented by a function returning wire
/// errors, so it can ask for an interaction
pub struct CaveatCheckerFunc<F>(pub F);

impl<F> ThirdPartyCaveatChecker for CaveatCheckerFunc<F>
where
    F: Fn(&Context, &ThirdPartyCaveatInfo) -> Result<Vec<Caveat>, Error>,
{
    type Error = Error;

    fn check_third_party_caveat(
        &self,
        ctx: &Context,
        info: &ThirdPartyCaveatInfo,
    ) -> Result<Vec<Caveat>, Error> {
        (self.0)(ctx, info)
    }
}

/// the token sent with a discharge request, set in the context given to
/// the caveat checker
pub fn discharge_token(ctx: &Context) -> Option<DischargeToken> {
    let kind = ctx.value(TOKEN_KIND_VALUE)?;
    let value = b64decode(ctx.value(TOKEN_VALUE)?).ok()?;
    Some(DischargeToken {
        kind: kind.to_string(),
        value,
    })
}

/// attaches `token` to `ctx`, as the handler does for discharge requests
pub fn with_discharge_token(ctx: Context, token: &DischargeToken) -> Context {
    ctx.with_value(TOKEN_KIND_VALUE, token.kind.as_str())
        .with_value(TOKEN_VALUE, raw_urlsafe_b64encode(&token.value))
}

/// serves discharge requests
pub struct DischargeHandler<C> {
    key: KeyPair,
    locator: Option<Arc<dyn ThirdPartyLocator>>,
    checker: C,
    prefix: String,
}

impl<C> DischargeHandler<C>
where
    C: ThirdPartyCaveatChecker<Error = Error>,
{
    pub fn new(key: KeyPair, checker: C) -> Self {
        DischargeHandler {
            key,
            locator: None,
            checker,
            prefix: String::new(),
        }
    }

    /// locator for the third party caveats the checker adds to discharges
    pub fn with_locator(mut self, locator: Arc<dyn ThirdPartyLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// serves the endpoints under `prefix` instead of the root
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_end_matches('/').to_string();
        self
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public()
    }

    /// answers `request`, 404 for paths that are not discharge endpoints
    pub fn handle(&self, ctx: &Context, request: &Request<Vec<u8>>) -> Response<Vec<u8>> {
        let path = request
            .uri()
            .path()
            .strip_prefix(self.prefix.as_str())
            .unwrap_or_default();

        match (request.method(), path) {
            (&Method::GET, "/discharge/info") => json_response(
                StatusCode::OK,
                &json!({
                    "PublicKey": self.key.public().to_base64(),
                    "Version": LATEST_VERSION,
                }),
            ),
            (&Method::GET, "/publickey") => json_response(
                StatusCode::OK,
                &json!({ "PublicKey": self.key.public().to_base64() }),
            ),
            (&Method::POST, "/discharge") => match self.discharge(ctx, request.body()) {
                Ok(response) => response,
                Err(e) => {
                    debug!(code = %e.code, error = %e, "discharge refused");
                    error_response(&e)
                }
            },
            _ => {
                let mut response = error_response(&Error::new(
                    ErrorCode::Other("not found".to_string()),
                    format!("{} not found", request.uri().path()),
                ));
                *response.status_mut() = StatusCode::NOT_FOUND;
                response
            }
        }
    }

    fn discharge(&self, ctx: &Context, body: &[u8]) -> Result<Response<Vec<u8>>, Error> {
        let form = DischargeForm::parse(body)?;

        let ctx = match &form.token {
            Some(token) => with_discharge_token(ctx.clone(), token),
            None => ctx.clone(),
        };
        let m = discharge(
            &ctx,
            &form.id,
            form.caveat.as_deref(),
            &self.key,
            &self.checker,
            self.locator.as_deref(),
        )?;
        info!("discharged third party caveat");

        let m = m
            .to_dict()
            .map_err(|e| Error::from(bakery_error::Bakery::from(e)))?;
        Ok(json_response(StatusCode::OK, &json!({ "Macaroon": m })))
    }
}

/// the fields of a discharge request
#[derive(Debug, Default)]
struct DischargeForm {
    id: Vec<u8>,
    caveat: Option<Vec<u8>>,
    token: Option<DischargeToken>,
}

impl DischargeForm {
    fn parse(body: &[u8]) -> Result<Self, Error> {
        let mut id = None;
        let mut form = DischargeForm::default();
        let mut token = None;
        let mut token_kind = None;

        for (key, value) in url::form_urlencoded::parse(body) {
            match key.as_ref() {
                "id" => id = Some(value.as_bytes().to_vec()),
                "id64" => id = Some(decode(&key, &value)?),
                "caveat64" => form.caveat = Some(decode(&key, &value)?),
                "token" => token = Some(value.as_bytes().to_vec()),
                "token64" => token = Some(decode(&key, &value)?),
                "token-kind" => token_kind = Some(value.into_owned()),
                _ => {}
            }
        }

        form.id = id.ok_or_else(|| Error::new(ErrorCode::BadRequest, "no caveat id found"))?;
        form.token = match (token, token_kind) {
            (Some(value), Some(kind)) => Some(DischargeToken { kind, value }),
            (None, None) => None,
            _ => {
                return Err(Error::new(
                    ErrorCode::BadRequest,
                    "discharge token requires both a value and a kind",
                ))
            }
        };
        Ok(form)
    }
}

fn decode(key: &str, value: &str) -> Result<Vec<u8>, Error> {
    b64decode(value)
        .map_err(|e| Error::new(ErrorCode::BadRequest, format!("invalid {}: {}", key, e)))
}
