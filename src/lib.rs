//! myrpc - a general-purpose RPC framework over TCP
//!
//! This library lets a client program invoke methods exposed by a remote
//! server process over TCP (optionally tunnelled through an HTTP
//! CONNECT), with pluggable wire codecs, per-call deadlines and
//! cancellation, and a heartbeat registry with client-side load balancing
//! across replicas.
//!
//! ## Main Components
//!
//! - `server`: accepts connections, negotiates session options, reads
//!   framed requests and dispatches them to registered services, running
//!   handlers concurrently while keeping each response atomic on the
//!   wire.
//!
//! - `service`: typed method registration. A service owns a set of named
//!   handlers; each handler decodes its argument, runs, and encodes its
//!   reply through an adapter stored at registration time.
//!
//! - `client`: a full-duplex session over a single connection carrying
//!   many in-flight calls, with a receiver task demultiplexing responses
//!   back to waiting callers.
//!
//! - `xclient`: a load-balancing client that pools one connection per
//!   endpoint, selects endpoints by policy, and can broadcast a call to
//!   every replica at once.
//!
//! - `discovery` and `registry`: the endpoint set abstraction, and the
//!   heartbeat-driven HTTP directory that keeps it fresh.
//!
//! - `codec`: `(header, body)` framing over a duplex byte stream, in a
//!   binary or JSON wire format negotiated per session.
//!
//! ## Usage
//!
//! Register services on a [`Server`] and hand it a TCP listener; dial it
//! with a [`Client`] (or an [`XClient`] over a [`Discovery`]) and invoke
//! methods by their `"Service.Method"` name.

pub mod client;
pub mod codec;
pub mod discovery;
mod error;
pub mod options;
pub mod registry;
pub mod server;
pub mod service;
pub mod xclient;

pub use client::{Call, Client};
pub use codec::{CodecKind, Header};
pub use discovery::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode};
pub use error::{Result, RpcError};
pub use options::Options;
pub use registry::Registry;
pub use server::Server;
pub use service::Service;
pub use xclient::XClient;
