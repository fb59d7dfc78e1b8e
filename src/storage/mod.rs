//! Durable message storage
//!
//! Two halves: [`MailStore`] keeps metadata rows in SQLite (inbox, sent,
//! users) behind a WAL journal with a busy-retry write path, and
//! [`ContentStore`] keeps one `.eml` file per message with atomic writes.
//! The engines compose both; neither half knows about the other.

pub mod content;
pub mod db;

pub use content::ContentStore;
pub use db::{MailRecord, MailStore, StoredUser};
