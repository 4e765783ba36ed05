//! # wirecall
//!
//! A minimal RPC runtime: a client/server pair that lets a caller
//! invoke a named method on a remote process, multiplexed over a
//! single TCP or Unix-socket stream, optionally preceded by an HTTP
//! CONNECT upgrade so the endpoint can coexist with a debug HTTP
//! surface.
//!
//! ## Architecture
//!
//! - **Codec**: frames `(Header, Body)` pairs on the stream; pluggable
//!   by short name, MessagePack by default
//! - **Service**: typed method registration, erased to bytes-in/
//!   bytes-out handlers at dispatch
//! - **Server**: option handshake, concurrent per-request handlers,
//!   per-call handle timeout
//! - **Client**: one background reader correlating responses to
//!   pending calls by sequence id
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use wirecall::{Client, Server, Service};
//!
//! #[tokio::main]
//! async fn main() -> wirecall::Result<()> {
//!     let server = Arc::new(Server::new());
//!     server.register(Service::new("Arith").method(
//!         "Add",
//!         |args: (i64, i64)| async move { Ok::<i64, String>(args.0 + args.1) },
//!     ))?;
//!
//!     let listener = TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?.to_string();
//!     tokio::spawn(server.accept(listener));
//!
//!     let client = Client::dial(&addr, None).await?;
//!     let sum: i64 = client.call("Arith.Add", &(1i64, 2i64)).await?;
//!     assert_eq!(sum, 3);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod options;
pub mod service;

mod client;
mod http;
mod server;

pub use client::{Call, Client};
pub use error::{Result, WirecallError};
pub use http::{CONNECTED, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};
pub use options::{Options, MAGIC_NUMBER};
pub use server::Server;
pub use service::Service;
