//! Class membership: identities, channel naming, event decoding, dedup and
//! the [`ClassService`] state machine.

pub mod backoff;
pub mod channels;
pub mod cursor;
pub mod dedup;
pub mod events;
pub mod identity;
pub mod models;
mod service;

pub use backoff::ReconnectPolicy;
pub use cursor::CursorThrottle;
pub use models::{
    ChatMessageReceived, ClassEvent, CursorData, Member, MessageKind, PrivateChatRequest, Role, User,
};
pub use service::{ClassService, HandlerId, Phase, ServiceOptions};
