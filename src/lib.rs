#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

//! ## Architecture
//! The server is built on several key components:
//!
//! - `Supervisor`: owns the listeners, hands accepted connections to the
//!   least-loaded worker and replaces workers that die
//! - `Worker`: a mio event loop driving every connection it was handed
//! - `Connection`: incremental request parsing and streamed responses
//! - `Router`: first-match routing over the rules of a `SiteFile`
//! - `Handler`: trait backing `linked` rules
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use hearth::{net, HandlerResponse, Reply, Request, Router, ServerConfig, SiteFile, Supervisor};
//!
//! fn main() -> hearth::Result<()> {
//!     let config = ServerConfig::default();
//!     let site = Arc::new(SiteFile::parse("define port 8080\nlinked /.*\n")?);
//!     let greet = |req: &Request| {
//!         HandlerResponse::new(200, Reply::Buffer(format!("hello {}", req.path_lossy()).into_bytes()))
//!     };
//!     let router = Router::new(site.clone()).with_handler(Arc::new(greet));
//!
//!     let listeners = net::bind_all(&site, config.host, config.backlog)?;
//!     let supervisor = Supervisor::new(&config, Arc::new(router), net::contexts(&site)?, listeners)?;
//!     supervisor.run()
//! }
//! ```

pub use crate::config::{ServerConfig, WorkerMode};
pub use crate::error::{HandoffError, ParseError, Result, ServerError, SiteFileError, WorkerError};
pub use crate::handler::{CommandHandler, Handler, HandlerResponse, Reply};
pub use crate::request::{Headers, Method, QueryField, Request};
pub use crate::response::{Body, Response, Status};
pub use crate::router::Router;
pub use crate::sitefile::SiteFile;
pub use crate::supervisor::{ShutdownHandle, Supervisor};

pub mod config;
pub mod connection;
pub mod error;
pub mod files;
pub mod framer;
pub mod handler;
pub mod handoff;
pub mod logging;
pub mod mime;
pub mod net;
pub mod pending;
pub mod percent;
pub mod privs;
pub mod request;
pub mod response;
pub mod router;
pub mod sitefile;
pub mod supervisor;
pub mod table;
pub mod worker;
