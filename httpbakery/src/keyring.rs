//! finding dischargers over HTTP
use std::collections::HashMap;
use std::sync::Arc;

use http::header::{HeaderValue, ACCEPT};
use http::{Method, Request, StatusCode};
use macaroon_bakery::third_party::canonical_location;
use macaroon_bakery::{error as bakery_error, PublicKey, ThirdPartyInfo, ThirdPartyLocator};
use macaroon_bakery::{LATEST_VERSION, VERSION_1};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::error::{self, field};
use crate::protocol::BAKERY_PROTOCOL_HEADER;
use crate::transport::Transport;

/// a [`ThirdPartyLocator`] asking each discharger for its public key
///
/// the information is fetched from `<location>/discharge/info`, or from
/// the legacy `<location>/publickey` endpoint when the former does not
/// exist, and cached for the lifetime of the locator
pub struct HttpLocator {
    transport: Arc<dyn Transport>,
    allow_insecure: bool,
    cache: RwLock<HashMap<String, ThirdPartyInfo>>,
}

impl HttpLocator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        HttpLocator {
            transport,
            allow_insecure: false,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// allows dischargers reached over plain HTTP
    pub fn allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    /// adds the information of a discharger, as if fetched
    pub fn add_info(&self, location: &str, info: ThirdPartyInfo) {
        self.cache
            .write()
            .insert(canonical_location(location).to_string(), info);
    }

    /// forgets every discharger found so far
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    fn fetch(&self, location: &str) -> Result<ThirdPartyInfo, error::Client> {
        let base = Url::parse(location)?;
        if base.scheme() != "https" && !self.allow_insecure {
            return Err(error::Client::Url(format!(
                "untrusted discharge URL {:?}",
                location
            )));
        }

        let (status, body) = self.get(&format!("{}/discharge/info", location))?;
        let (status, body) = if status == StatusCode::NOT_FOUND {
            warn!(location, "no discharge info endpoint, using the legacy public key one");
            self.get(&format!("{}/publickey", location))?
        } else {
            (status, body)
        };
        if status != StatusCode::OK {
            return Err(error::Client::Protocol(format!(
                "cannot get discharge info from {}: status {}",
                location, status
            )));
        }
        parse_info(&body)
    }

    fn get(&self, url: &str) -> Result<(StatusCode, Value), error::Client> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header(BAKERY_PROTOCOL_HEADER, LATEST_VERSION)
            .body(Vec::new())?;
        let response = self.transport.round_trip(request)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Ok((status, Value::Null));
        }
        Ok((status, serde_json::from_slice(response.body())?))
    }
}

/// parses `{"PublicKey": <base64>, "Version": <int>}`, a missing version
/// meaning version 1
fn parse_info(body: &Value) -> Result<ThirdPartyInfo, error::Client> {
    let info: &Map<String, Value> = body
        .as_object()
        .ok_or_else(|| error::Client::Protocol("discharge info is not an object".to_string()))?;
    let public_key = match field(info, "PublicKey") {
        Some(Value::String(key)) => PublicKey::from_base64(key)?,
        _ => {
            return Err(error::Client::Protocol(
                "no public key in discharge info".to_string(),
            ))
        }
    };
    let version = match field(info, "Version") {
        None | Some(Value::Null) => VERSION_1,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| error::Client::Protocol("invalid discharger version".to_string()))?,
    };
    Ok(ThirdPartyInfo {
        public_key,
        version,
    })
}

impl ThirdPartyLocator for HttpLocator {
    fn third_party_info(&self, location: &str) -> Result<ThirdPartyInfo, bakery_error::Bakery> {
        let location = canonical_location(location);
        if let Some(info) = self.cache.read().get(location) {
            return Ok(info.clone());
        }

        let info = self.fetch(location).map_err(|e| {
            bakery_error::Bakery::ThirdPartyInfoNotFound(format!("{}: {}", location, e))
        })?;
        debug!(location, version = info.version, "found discharger");
        self.cache
            .write()
            .entry(location.to_string())
            .or_insert_with(|| info.clone());
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Response;
    use macaroon_bakery::{KeyPair, VERSION_2};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn json(status: StatusCode, body: Value) -> Response<Vec<u8>> {
        let mut response = Response::new(body.to_string().into_bytes());
        *response.status_mut() = status;
        response
    }

    #[test]
    fn fetches_and_caches() {
        let key = KeyPair::new().public();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = move |req: Request<Vec<u8>>| -> Result<Response<Vec<u8>>, error::Client> {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(req.uri().to_string(), "https://ids.example.com/discharge/info");
            Ok(json(
                StatusCode::OK,
                json!({"PublicKey": key.to_base64(), "Version": 2}),
            ))
        };
        let locator = HttpLocator::new(Arc::new(transport));

        for location in ["https://ids.example.com/", "https://ids.example.com"] {
            let info = locator.third_party_info(location).unwrap();
            assert_eq!(info.public_key, key);
            assert_eq!(info.version, VERSION_2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        locator.clear_cache();
        locator.third_party_info("https://ids.example.com").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn legacy_public_key_endpoint() {
        let key = KeyPair::new().public();
        let transport = move |req: Request<Vec<u8>>| -> Result<Response<Vec<u8>>, error::Client> {
            if req.uri().path() == "/discharge/info" {
                return Ok(json(StatusCode::NOT_FOUND, Value::Null));
            }
            assert_eq!(req.uri().path(), "/publickey");
            Ok(json(StatusCode::OK, json!({"PublicKey": key.to_base64()})))
        };
        let locator = HttpLocator::new(Arc::new(transport)).allow_insecure(true);
        let info = locator.third_party_info("http://ids").unwrap();
        assert_eq!(info.public_key, key);
        assert_eq!(info.version, VERSION_1);
    }

    #[test]
    fn insecure_locations_are_refused() {
        let transport = |_: Request<Vec<u8>>| -> Result<Response<Vec<u8>>, error::Client> {
            panic!("no request expected")
        };
        let locator = HttpLocator::new(Arc::new(transport));
        assert!(matches!(
            locator.third_party_info("http://ids.example.com"),
            Err(bakery_error::Bakery::ThirdPartyInfoNotFound(_))
        ));
    }

    #[test]
    fn discharger_errors() {
        let transport = |_: Request<Vec<u8>>| -> Result<Response<Vec<u8>>, error::Client> {
            Ok(json(StatusCode::INTERNAL_SERVER_ERROR, Value::Null))
        };
        let locator = HttpLocator::new(Arc::new(transport));
        assert!(matches!(
            locator.third_party_info("https://ids.example.com"),
            Err(bakery_error::Bakery::ThirdPartyInfoNotFound(_))
        ));
    }
}
