//! Chat Log - the shared, append-only message log behind a chat room
//!
//! Every participant's input ends up here, and every participant's screen
//! is rendered from here. The log is the only shared mutable state: appends
//! are serialized and flushed to disk before they are acknowledged, and
//! readers follow it with [`Tail`]s that suspend until something new arrives.
//!
//! # Example
//!
//! ```no_run
//! use chat_log::{BroadcastLog, Identity};
//!
//! #[tokio::main]
//! async fn main() {
//!     let log = BroadcastLog::open("/tmp/chat/chat.log").await.unwrap();
//!     let mut tail = log.tail_recent(20);
//!
//!     let me = Identity::parse("chat01").unwrap();
//!     log.append(&me, "hello").await.unwrap();
//!
//!     while let Some(message) = tail.next().await {
//!         println!("{}", message.render());
//!     }
//! }
//! ```

mod error;
mod identity;
mod log;
mod message;
mod sanitize;

pub use error::LogError;
pub use identity::{Identity, MAX_IDENTITY_LEN};
pub use log::{BroadcastLog, Position, Tail};
pub use message::{Message, TIMESTAMP_FORMAT};
pub use sanitize::sanitize_line;
