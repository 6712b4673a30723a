//! Rotary Messaging
//!
//! Request/reply messaging between two endpoints of a
//! [`Channel`](rotary_channel::Channel), plus the scheduler that drives many
//! endpoints from one thread.
//!
//! # Exchanges
//!
//! ```text
//!  caller                                   callee
//!  ──────                                   ──────
//!  send_message(topic, payload, handler)
//!    └─ Control A (source = A) ───────────▶ process_new_message
//!                                             └─ listener → Control B
//!                                                (target = B, thread = T)
//!  process_new_message ◀──── reply ─────────  (source = B, target = A)
//!    └─ handler(A)
//!  deferred_reply(A) ───────────────────────▶ handler(B)  (if B kept)
//! ```
//!
//! Each side's [`Control`] lives in a [`MessageThreadRegistry`] for as long
//! as it sets `keep_control`.

mod bus;
mod control;
mod envelope;
mod error;
mod patch;
mod registry;
pub mod scheduler;

pub use bus::{ListenerId, MessageBus};
pub use control::{Continuation, Control, ReplyHandler, ReplyStatus, SharedControl};
pub use envelope::{ControlId, Envelope, ThreadId, Topic};
pub use error::MessagingError;
pub use patch::{MessagePatch, MessagePatcher};
pub use registry::MessageThreadRegistry;
pub use scheduler::{
  MESSENGER_FALLBACK_TIMEOUT, MessagingScheduler, SchedulerHandle, ServeRequests, SourceId,
};
