//! sending HTTP requests
//!
//! The client only needs a blocking round trip, so it is abstracted behind
//! [`Transport`]. [`ReqwestTransport`] implements it with `reqwest` when
//! the `reqwest` feature is enabled, tests route requests to in-process
//! handlers.
use http::{Request, Response};

use crate::error;

/// sends one request and returns its response
///
/// implementations must not follow discharge required responses, the
/// client handles them
pub trait Transport: Send + Sync {
    fn round_trip(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, error::Client>;
}

/// any function handling requests, like an in-process router
impl<F> Transport for F
where
    F: Fn(Request<Vec<u8>>) -> Result<Response<Vec<u8>>, error::Client> + Send + Sync,
{
    fn round_trip(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, error::Client> {
        self(request)
    }
}

#[cfg(feature = "reqwest")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use std::time::Duration;

    use http::{Request, Response};

    use super::Transport;
    use crate::error;
    use crate::protocol::DEFAULT_TIMEOUT;

    impl From<reqwest::Error> for error::Client {
        fn from(e: reqwest::Error) -> Self {
            if e.is_timeout() {
                error::Client::Timeout(e.to_string())
            } else {
                error::Client::Transport(e.to_string())
            }
        }
    }

    /// a blocking [`Transport`] backed by `reqwest`
    ///
    /// redirects are followed, cookies are left to the bakery client
    #[derive(Clone, Debug)]
    pub struct ReqwestTransport {
        client: reqwest::blocking::Client,
    }

    impl ReqwestTransport {
        pub fn new() -> Result<Self, error::Client> {
            Self::with_timeout(DEFAULT_TIMEOUT)
        }

        pub fn with_timeout(timeout: Duration) -> Result<Self, error::Client> {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()?;
            Ok(ReqwestTransport { client })
        }
    }

    impl Transport for ReqwestTransport {
        fn round_trip(
            &self,
            request: Request<Vec<u8>>,
        ) -> Result<Response<Vec<u8>>, error::Client> {
            let (parts, body) = request.into_parts();
            let response = self
                .client
                .request(parts.method, parts.uri.to_string())
                .headers(parts.headers)
                .body(body)
                .send()?;

            let mut builder = Response::builder().status(response.status());
            for (name, value) in response.headers() {
                builder = builder.header(name, value);
            }
            let body = response.bytes()?.to_vec();
            Ok(builder.body(body)?)
        }
    }
}
