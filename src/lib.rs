//! Async HTTP/1.1 and HTTP/2 client connection core.
//!
//! `bora` binds a logical [`Endpoint`] to one remote address and produces
//! [`Exchange`]s over a pooled set of connections:
//!
//! - cold, backpressured [`Payload`] streams for request and response bodies;
//! - an interceptor pipeline that can mutate or answer exchanges before
//!   they touch the wire;
//! - pipelined HTTP/1.1 and multiplexed HTTP/2 connection state machines;
//! - WebSocket upgrades that detach their connection from the pool.
//!
//! ```no_run
//! use bora::{endpoint, Method};
//!
//! # async fn run() -> bora::Result<()> {
//! let ep = endpoint("example.org:80").build::<()>()?;
//! let mut exchange = ep.exchange(Method::GET, "/", ())?;
//! let mut response = exchange.response().await?.expect("not reset");
//! let body = response.aggregate().await?;
//! println!("{} {} bytes", response.status(), body.len());
//! ep.shutdown_gracefully().await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

pub mod collab;

mod config;
pub use self::config::{CodecConfig, EndpointConfig, HttpVersion, ProtocolSet};

mod error;
pub use self::error::{BoxError, Error, Reason, Result};

mod payload;
pub use self::payload::{Payload, PayloadStream};

mod request;
pub use self::request::{Request, RequestBody};

mod response;
pub use self::response::Response;

mod exchange;
pub use self::exchange::{
    Exchange, InterceptFlow, InterceptedExchange, InterceptedResponse, Interceptor, InterceptorExt,
};

mod endpoint;
pub use self::endpoint::{Endpoint, EndpointBuilder, endpoint};

pub(crate) mod proto;
pub use self::proto::Upgraded;

mod ws;
pub use self::ws::WebSocketExchange;

pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version, header};
