//! protocol version negotiation and the responses services send
use std::time::Duration;

use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{Response, StatusCode};
use macaroon_bakery::{error as bakery_error, Macaroon, LATEST_VERSION, VERSION_0, VERSION_1};
use serde_json::Value;
use tracing::error;

use crate::error::{Error, ErrorCode};

/// `Bakery-Protocol-Version` header, carrying the bakery protocol version
/// of the client
pub const BAKERY_PROTOCOL_HEADER: &str = "bakery-protocol-version";

/// discharge required responses a client follows for one request
pub const MAX_DISCHARGE_RETRIES: u32 = 3;

/// timeout of each HTTP call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// the version declared by the client, `None` when absent or invalid
fn declared_version(headers: &HeaderMap) -> Option<u32> {
    headers
        .get(BAKERY_PROTOCOL_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// bakery version to use with a client, from its request headers
///
/// clients that do not declare a version get version 1, versions newer
/// than this library are capped
pub fn request_version(headers: &HeaderMap) -> u32 {
    declared_version(headers)
        .map(|v| v.min(LATEST_VERSION))
        .unwrap_or(VERSION_1)
}

/// a JSON response
pub fn json_response(status: StatusCode, body: &Value) -> Response<Vec<u8>> {
    let mut response = Response::new(body.to_string().into_bytes());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// the response carrying `error`, with the status of its code
pub fn error_response(error: &Error) -> Response<Vec<u8>> {
    match error.to_json() {
        Ok(body) => json_response(error.code.status(), &body),
        Err(e) => {
            error!(error = %e, "cannot serialize error response");
            let mut response = Response::new(b"cannot serialize error".to_vec());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

/// the response asking the client to discharge `m` and retry
///
/// `path` is the path the discharged macaroon applies to, relative to the
/// request URL. Clients that did not declare a protocol version, or
/// declared version 0, only understand a `407 Proxy Authentication
/// Required` response. Newer ones get `401 Unauthorized` with a
/// `WWW-Authenticate: Macaroon` header.
pub fn discharge_required_response(
    headers: &HeaderMap,
    m: &Macaroon,
    path: &str,
    cookie_name_suffix: Option<&str>,
    message: &str,
) -> Result<Response<Vec<u8>>, bakery_error::Format> {
    let mut error = Error::new(ErrorCode::DischargeRequired, message);
    error.info.macaroon = Some(m.clone());
    error.info.macaroon_path = Some(path.to_string());
    error.info.cookie_name_suffix = cookie_name_suffix.map(str::to_string);
    let body = error.to_json()?;

    let legacy = matches!(declared_version(headers), None | Some(VERSION_0));
    if legacy {
        return Ok(json_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, &body));
    }
    let mut response = json_response(StatusCode::UNAUTHORIZED, &body);
    response
        .headers_mut()
        .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Macaroon"));
    Ok(response)
}

/// returns true if `response` asks for a discharge
pub(crate) fn is_discharge_required(response: &Response<Vec<u8>>) -> bool {
    match response.status() {
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => true,
        StatusCode::UNAUTHORIZED => response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .any(|v| v.as_bytes() == b"Macaroon"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use macaroon_bakery::checkers::legacy_namespace;
    use macaroon_bakery::{VERSION_2, VERSION_3};

    fn headers(version: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(v) = version {
            headers.insert(BAKERY_PROTOCOL_HEADER, HeaderValue::from_static(v));
        }
        headers
    }

    #[test]
    fn version_negotiation() {
        assert_eq!(request_version(&headers(None)), VERSION_1);
        assert_eq!(request_version(&headers(Some("garbage"))), VERSION_1);
        assert_eq!(request_version(&headers(Some("0"))), VERSION_0);
        assert_eq!(request_version(&headers(Some("2"))), VERSION_2);
        assert_eq!(request_version(&headers(Some("3"))), VERSION_3);
        assert_eq!(request_version(&headers(Some("42"))), LATEST_VERSION);
    }

    #[test]
    fn discharge_required_status() {
        let m = Macaroon::new(
            b"root key",
            b"id".to_vec(),
            "loc",
            VERSION_3,
            legacy_namespace(),
        )
        .unwrap();

        for (version, status) in [
            (None, StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            (Some("0"), StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            (Some("1"), StatusCode::UNAUTHORIZED),
            (Some("3"), StatusCode::UNAUTHORIZED),
        ] {
            let response =
                discharge_required_response(&headers(version), &m, "/", Some("test"), "login")
                    .unwrap();
            assert_eq!(response.status(), status);
            assert_eq!(
                response.headers().contains_key(WWW_AUTHENTICATE),
                status == StatusCode::UNAUTHORIZED
            );
            assert!(is_discharge_required(&response));

            let body: Value = serde_json::from_slice(response.body()).unwrap();
            let error = Error::from_json(&body).unwrap();
            assert_eq!(error.code, ErrorCode::DischargeRequired);
            assert_eq!(error.info.macaroon.as_ref(), Some(&m));
            assert_eq!(error.info.macaroon_path.as_deref(), Some("/"));
            assert_eq!(error.info.cookie_name_suffix.as_deref(), Some("test"));
        }
    }

    #[test]
    fn plain_unauthorized_is_not_a_discharge_request() {
        let error = Error::new(ErrorCode::PermissionDenied, "no");
        assert!(!is_discharge_required(&error_response(&error)));
    }
}
