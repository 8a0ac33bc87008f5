//! Asterisk Manager Interface (AMI) client for Rust
//!
//! This crate provides an async Rust client for Asterisk's Manager Interface,
//! allowing applications to log in to Asterisk, send actions, and receive
//! events over TCP or the built-in HTTP server.
//!
//! # Architecture
//!
//! - [`Manager`] (Clone + Send) sends actions from any task and owns the
//!   connection lifecycle
//! - a background reader task feeds incoming bytes to the [`Connection`] state
//!   machine, which resolves each [`PendingResponse`] by `ActionID` and hands
//!   everything else to the [`EventRegistry`]
//!
//! Many actions may be in flight at once; each caller is woken only by the
//! response carrying its own `ActionID`.
//!
//! # Examples
//!
//! ## Actions
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{Action, AmiError, Manager, ManagerOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let manager = Manager::new(ManagerOptions::new("localhost", "admin", "secret"));
//!     manager.connect().await?;
//!
//!     let response = manager
//!         .send_action(Action::new([("Action", "CoreStatus")]))
//!         .await?;
//!     println!("Calls: {}", response.header("CoreCurrentCalls").unwrap_or("?"));
//!
//!     let peers = manager
//!         .send_list_action(Action::named("PJSIPShowEndpoints"))
//!         .await?;
//!     println!("{} endpoint entries", peers.len().saturating_sub(2));
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Event Subscription
//!
//! Patterns are globs over the `Event` header (`*` and `?`):
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{Manager, ManagerOptions, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Manager::new(
//!         ManagerOptions::new("localhost", "admin", "secret").with_events("call"),
//!     );
//!     manager.register_event("Hangup", |event: &Message, _: &Manager| {
//!         println!("{} hung up", event.header("Channel").unwrap_or("?"));
//!     });
//!     manager.register_event("Newchannel", |event: &Message, _: &Manager| {
//!         println!("new channel {}", event.header("Channel").unwrap_or("?"));
//!     });
//!     manager.connect().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Parsing
//!
//! ```rust
//! use asterisk_ami_tokio::Message;
//!
//! let message = Message::parse("Response: Success\r\nPing: Pong\r\nPing: Pong").unwrap();
//! assert!(message.success());
//! assert_eq!(message.get_all("Ping"), ["Pong", "Pong"]);
//! ```
//!
//! ## Without a runtime
//!
//! [`ExecutionMode::Sync`] swaps the reader task for blocking socket I/O:
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{Action, ExecutionMode, Manager, ManagerOptions};
//!
//! let manager = Manager::new(
//!     ManagerOptions::new("localhost", "admin", "secret").with_mode(ExecutionMode::Sync),
//! );
//! manager.connect_blocking()?;
//! let pong = manager.send_action_blocking(Action::ping())?;
//! assert!(pong.success());
//! manager.close_blocking();
//! # Ok::<(), asterisk_ami_tokio::AmiError>(())
//! ```

#[macro_use]
mod macros;

pub mod action;
pub mod config;
pub mod connection;
pub mod error;
pub mod headers;
pub mod manager;
pub mod message;
pub mod registry;

pub(crate) mod blocking;
pub(crate) mod buffer;
pub mod constants;
pub(crate) mod http;
pub(crate) mod protocol;

pub use action::{Action, IdGenerator};
pub use config::{ExecutionMode, ManagerOptions, Transport};
pub use connection::{BoxedWriter, Connection, ConnectionState, PendingList, PendingResponse};
pub use constants::DEFAULT_AMI_PORT;
pub use error::{AmiError, AmiResult};
pub use headers::{AmiHeader, ParseAmiHeaderError, ParseResponseStatusError, ResponseStatus};
pub use manager::Manager;
pub use message::{HeaderValue, Message, MessageKind};
pub use protocol::AmiParser;
pub use registry::{glob_match, Dispatch, EventCallback, EventRegistry};
