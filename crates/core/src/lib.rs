//! # rtsp — a mediating RTSP server
//!
//! Publishers push media streams into named paths with `ANNOUNCE`/`RECORD`;
//! readers pull those same paths with `SETUP`/`PLAY`. Media travels over
//! either UDP (separate RTP/RTCP sockets) or TCP-interleaved (multiplexed
//! inside the RTSP control connection); the control handshake itself is
//! always TCP. Paths can also be configured to pull from an upstream RTSP
//! server instead of accepting a local publisher.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │  Server            — binds sockets, owns threads  │
//! ├───────────────────────────────────────────────────┤
//! │  Dispatcher         — single serialized state owner│
//! │  (clients set, publisher registry, counters)       │
//! ├──────────────┬──────────────┬──────────┬───────────┤
//! │  TCP listener│ UDP listeners│ Session  │  Puller    │
//! │  (accept)    │ (RTP/RTCP)   │ (1/conn) │ (upstream) │
//! └──────────────┴──────────────┴──────────┴───────────┘
//! ```
//!
//! Every producer — the TCP listener, the two UDP listeners, each client
//! connection, each upstream puller — holds only a
//! [`dispatcher::DispatcherHandle`] and communicates by sending typed
//! [`dispatcher::event::Event`]s. The dispatcher is the sole owner of the
//! clients set, the per-path publisher registry, and the
//! `publisherCount`/`receiverCount` counters; no lock is ever taken on that
//! state because nothing outside the dispatcher's own thread ever touches
//! it.
//!
//! ## Quick start
//!
//! ```no_run
//! use rtsp::{Config, Server};
//!
//! let config = Config::default();
//! let server = Server::start(config).expect("failed to start server");
//! // ... server runs on background threads until stopped ...
//! server.stop().expect("failed to stop server");
//! ```
//!
//! ## Crate layout
//!
//! - [`config`] — [`Config`] and per-path [`config::PathConf`], deserialized
//!   from YAML and validated before the server starts.
//! - [`dispatcher`] — the event dispatcher: [`dispatcher::Dispatcher`], its
//!   [`dispatcher::DispatcherHandle`] front-end, and the
//!   [`dispatcher::event::Event`] taxonomy.
//! - [`session`] — the per-connection RTSP state machine
//!   ([`session::ClientSession`]) and [`session::auth`] credential/IP checks.
//! - [`puller`] — the upstream puller that republishes a pulled RTSP stream
//!   onto a local path.
//! - [`protocol`] — RTSP request/response parsing, SDP media counting, and
//!   TCP-interleaved frame encoding.
//! - [`transport`] — the TCP accept loop and the two UDP listeners.
//! - [`server`] — [`Server`], the orchestrator that binds sockets and starts
//!   every background thread.
//! - [`error`] — [`RtspError`] and the crate's [`Result`] alias.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod puller;
pub mod server;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{Result, RtspError};
pub use server::Server;
