//! # Broker Module
//!
//! The network side of the broker.
//!
//! - `server`: the shared [`Broker`] state, the accept loop and publish fan-out.
//! - `connection`: one task per client, from CONNECT to teardown.
//! - `registry`: client identity to session mapping, including takeover.
//! - `transport`: bounded, retrying socket I/O.

pub mod connection;
pub mod registry;
pub mod server;
pub mod transport;

pub use self::registry::SessionRegistry;
pub use self::server::{serve, Broker};
pub use self::transport::{Retrier, Transport};
