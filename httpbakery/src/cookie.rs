//! macaroon cookies
//!
//! Discharged macaroons are kept by the client in `macaroon-<suffix>`
//! cookies whose value is the base64 encoded JSON array of the macaroon
//! and its discharges. Services read them back with [`extract_macaroons`].
use http::header::{HeaderMap, COOKIE};
use macaroon_bakery::format::{b64decode, raw_urlsafe_b64encode};
use macaroon_bakery::Slice;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::debug;
use url::Url;

use crate::error;

/// prefix of the names of macaroon cookies
pub const COOKIE_PREFIX: &str = "macaroon-";

/// suffix used when the service does not choose one
pub const DEFAULT_COOKIE_SUFFIX: &str = "auth";

/// `Macaroons` header, carrying macaroons for clients that do not use
/// cookies
pub const MACAROONS_HEADER: &str = "macaroons";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// the cookie is sent to this path and the paths below it
    pub path: String,
    /// the cookie is dropped after this time, `None` for session cookies
    pub expires: Option<OffsetDateTime>,
}

impl Cookie {
    fn matches_path(&self, path: &str) -> bool {
        if self.path.is_empty() || self.path == "/" {
            return true;
        }
        match path.strip_prefix(self.path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || self.path.ends_with('/'),
            None => false,
        }
    }

    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires.map_or(false, |expires| expires <= now)
    }
}

/// formats `cookies` as a `Cookie` header value
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// stores the cookies of a client
pub trait CookieJar: Send + Sync {
    /// stores a cookie set by the host of `url`, replacing the cookie with
    /// the same name and path
    fn set_cookie(&self, url: &Url, cookie: Cookie);

    /// cookies to send with a request to `url`
    fn cookies(&self, url: &Url) -> Vec<Cookie>;
}

/// a [`CookieJar`] in memory, scoping cookies by host and path
#[derive(Debug, Default)]
pub struct MemoryJar {
    cookies: Mutex<Vec<(String, Cookie)>>,
}

impl MemoryJar {
    pub fn new() -> Self {
        MemoryJar::default()
    }
}

impl CookieJar for MemoryJar {
    fn set_cookie(&self, url: &Url, cookie: Cookie) {
        let host = url.host_str().unwrap_or_default().to_string();
        let mut cookies = self.cookies.lock();
        cookies.retain(|(h, c)| !(*h == host && c.name == cookie.name && c.path == cookie.path));
        if !cookie.is_expired(OffsetDateTime::now_utc()) {
            cookies.push((host, cookie));
        }
    }

    fn cookies(&self, url: &Url) -> Vec<Cookie> {
        let host = url.host_str().unwrap_or_default();
        let now = OffsetDateTime::now_utc();
        let mut cookies = self.cookies.lock();
        cookies.retain(|(_, c)| !c.is_expired(now));
        cookies
            .iter()
            .filter(|(h, c)| h == host && c.matches_path(url.path()))
            .map(|(_, c)| c.clone())
            .collect()
    }
}

/// encodes a macaroon slice as a cookie or header value
pub fn encode_macaroons(slice: &Slice) -> Result<String, error::Client> {
    let json = serde_json::to_vec(slice)?;
    Ok(raw_urlsafe_b64encode(json))
}

/// decodes a value produced by [`encode_macaroons`]
pub fn decode_macaroons(value: &str) -> Result<Slice, error::Client> {
    let json = b64decode(value)?;
    let slice: Slice = serde_json::from_slice(&json)?;
    if slice.is_empty() {
        return Err(error::Client::Protocol("no macaroons in value".to_string()));
    }
    Ok(slice)
}

/// collects the macaroon slices sent with a request, from `macaroon-*`
/// cookies and `Macaroons` headers
///
/// values that cannot be decoded are ignored
pub fn extract_macaroons(headers: &HeaderMap) -> Vec<Slice> {
    let mut slices = Vec::new();

    let cookies = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|c| c.trim().split_once('='));
    for (name, value) in cookies {
        if !name.starts_with(COOKIE_PREFIX) {
            continue;
        }
        match decode_macaroons(value) {
            Ok(slice) => slices.push(slice),
            Err(e) => debug!(cookie = name, error = %e, "ignoring invalid macaroon cookie"),
        }
    }

    for value in headers.get_all(MACAROONS_HEADER) {
        let decoded = value
            .to_str()
            .map_err(|e| error::Client::Protocol(e.to_string()))
            .and_then(decode_macaroons);
        match decoded {
            Ok(slice) => slices.push(slice),
            Err(e) => debug!(error = %e, "ignoring invalid macaroons header"),
        }
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use macaroon_bakery::checkers::legacy_namespace;
    use macaroon_bakery::{Macaroon, VERSION_2};
    use time::Duration;

    fn slice(id: &str) -> Slice {
        let m = Macaroon::new(b"key", id.as_bytes().to_vec(), "loc", VERSION_2, legacy_namespace())
            .unwrap();
        vec![m.into_macaroon()]
    }

    fn cookie(name: &str, path: &str, expires: Option<OffsetDateTime>) -> Cookie {
        Cookie {
            name: name.to_string(),
            value: "v".to_string(),
            path: path.to_string(),
            expires,
        }
    }

    #[test]
    fn jar_scoping() {
        let jar = MemoryJar::new();
        let url = Url::parse("http://example.com/a/b").unwrap();
        jar.set_cookie(&url, cookie("root", "/", None));
        jar.set_cookie(&url, cookie("a", "/a", None));
        jar.set_cookie(&url, cookie("c", "/c", None));
        jar.set_cookie(
            &url,
            cookie("old", "/", Some(OffsetDateTime::now_utc() - Duration::hours(1))),
        );

        let names = |url: &str| -> Vec<String> {
            jar.cookies(&Url::parse(url).unwrap())
                .into_iter()
                .map(|c| c.name)
                .collect()
        };
        assert_eq!(names("http://example.com/a/b"), vec!["root", "a"]);
        assert_eq!(names("http://example.com/ab"), vec!["root"]);
        assert_eq!(names("http://example.com/c"), vec!["root", "c"]);
        assert!(names("http://other.com/a").is_empty());

        // replaced, not duplicated
        jar.set_cookie(&url, cookie("root", "/", None));
        assert_eq!(names("http://example.com/"), vec!["root"]);
        assert_eq!(names("http://example.com/a/b"), vec!["a", "root"]);
    }

    #[test]
    fn extract_from_cookies_and_headers() {
        let first = slice("first");
        let second = slice("second");

        let mut headers = HeaderMap::new();
        let cookies = format!(
            "other=1; macaroon-auth={}; macaroon-bad=%%%",
            encode_macaroons(&first).unwrap()
        );
        headers.insert(COOKIE, HeaderValue::from_str(&cookies).unwrap());
        headers.insert(
            MACAROONS_HEADER,
            HeaderValue::from_str(&encode_macaroons(&second).unwrap()).unwrap(),
        );

        assert_eq!(extract_macaroons(&headers), vec![first, second]);
    }

    #[test]
    fn header_value() {
        assert_eq!(
            cookie_header(&[cookie("a", "/", None), cookie("b", "/", None)]),
            "a=v; b=v"
        );
    }
}
