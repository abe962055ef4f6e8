//! Classroom live chat client.
//!
//! A teacher and students share a class channel on a managed pub/sub provider,
//! exchange chat, system and hand-raise messages, and can move into private
//! one-on-one channels. Membership bookkeeping goes to a REST backend.

pub mod classroom;
pub mod config;
pub mod error;
pub mod notifier;
pub mod pages;
pub mod transport;

pub use classroom::{ClassEvent, ClassService, Phase, ServiceOptions, User};
pub use config::Config;
pub use error::{ClassError, NotifyError, Result, TransportError};
pub use notifier::{HttpNotifier, Notifier};
pub use transport::{ConnectionState, MemoryBroker, RealtimeTransport, Transport};
