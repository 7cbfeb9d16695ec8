//! greytrap-rs: SMTP tarpit and greylisting daemon
//!
//! Defends a real mail server by accepting connections from suspected spam
//! sources and slowing them down. Blacklisted clients are trapped in a
//! stuttering byte-at-a-time SMTP dialogue that ends in a rejection;
//! everyone else is greylisted: the first delivery attempt is refused with
//! a temporary failure, and only senders that retry after a delay are
//! promoted into the firewall's whitelist set. Spam-trap recipients
//! promote the offending source address straight onto the blacklist.
//!
//! # Components
//!
//! - [`smtp`]: the connection engine (accept loop, tarpit state machine)
//! - [`grey`]: the greylisting engine (reader + scanner around the store)
//! - [`store`]: driver-abstracted tuple store (sqlite, memory)
//! - [`blacklist`]: feed compiler and accept-time address index
//! - [`net`]: address/CIDR arithmetic and the radix trie
//! - [`proto`]: the key/value message protocol spoken on internal pipes
//! - [`firewall`]: firewall driver contract and helper task
//! - [`sync`]: authenticated multicast/UDP peer replication
//!
//! # Example
//!
//! ```no_run
//! use greytrap_rs::config::Config;
//! use greytrap_rs::daemon::Daemon;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     Daemon::new(config).run().await?;
//!     Ok(())
//! }
//! ```

pub mod blacklist;
pub mod config;
pub mod daemon;
pub mod error;
pub mod firewall;
pub mod grey;
pub mod net;
pub mod proto;
pub mod smtp;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use config::Config;
pub use error::{GreytrapError, Result};
