//! HTTP protocol for macaroon-bakery
//!
//! Services protect their endpoints with macaroons minted by a
//! [`macaroon_bakery::Bakery`]. When a request does not carry the macaroons
//! it needs, the service answers with a discharge required error holding
//! a new macaroon ([`discharge_required_response`]). The [`Client`] then
//! collects the discharges of its third party caveats from the
//! dischargers, interacting with them when they require it, stores the
//! result in a cookie and retries the request.
//!
//! Dischargers serve the discharge endpoints with a [`DischargeHandler`],
//! and services find their public keys with an [`HttpLocator`].
//!
//! Requests go through a [`Transport`]: a blocking `reqwest` client with
//! the `reqwest` feature, or any function handling requests.
//!
//! ```rust
//! use http::{Request, Response, StatusCode};
//! use macaroon_httpbakery::{error, json_response, Client};
//! use serde_json::json;
//!
//! let client = Client::new(
//!     |_: Request<Vec<u8>>| -> Result<Response<Vec<u8>>, error::Client> {
//!         Ok(json_response(StatusCode::OK, &json!({"hello": "world"})))
//!     },
//! );
//! let request = Request::get("https://service.example.com/")
//!     .body(Vec::new())
//!     .unwrap();
//! let response = client.do_request(request).unwrap();
//! assert_eq!(response.status(), StatusCode::OK);
//! ```
pub mod client;
pub mod cookie;
pub mod discharger;
pub mod error;
pub mod interactor;
pub mod keyring;
pub mod protocol;
pub mod transport;

pub use client::{Client, ClientConfig};
pub use cookie::{extract_macaroons, CookieJar, MemoryJar};
pub use discharger::{discharge_token, CaveatCheckerFunc, DischargeHandler};
pub use error::{Error, ErrorCode, ErrorInfo};
pub use interactor::{
    Agent, AgentInteractor, DischargeToken, Interactor, WebBrowserInteractor,
};
pub use keyring::HttpLocator;
pub use protocol::{
    discharge_required_response, error_response, json_response, request_version,
    BAKERY_PROTOCOL_HEADER,
};
pub use transport::Transport;
#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;
