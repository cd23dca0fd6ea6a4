//! Zero-downtime replacement of a line echo server.
//!
//! A running generation owns one listener. On upgrade it hands the listener,
//! and the most recent live connection, to a freshly started successor and
//! then drains: no new connections are accepted, existing ones are served to
//! completion, and the process exits.

pub mod accept;
pub mod config;
pub mod coordinator;
pub mod drain;
pub mod error;
pub mod handler;
pub mod listener;
pub mod pidfile;
pub mod signals;
pub mod upgrader;

pub use config::ServerConf;
pub use coordinator::{Coordinator, Exit, GenerationState};
pub use drain::DrainSet;
pub use error::{Error, Result, UpgradeError};
pub use handler::{ConnectionHandler, EchoHandler};
pub use listener::{Connection, Listener, Network};
pub use upgrader::{LocalUpgrader, ProcessUpgrader, Upgrader};
