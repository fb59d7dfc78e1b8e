//! Message data model and format codec boundary
//!
//! The engines deal in raw octets on the wire; this module is where those
//! octets meet a structured [`Message`]: address grammar, header parsing,
//! MIME multipart handling and message framing.

pub mod address;
pub mod mime;
pub mod types;

pub use address::Address;
pub use mime::{MessageBuilder, MimeParser};
pub use types::{generate_message_id, Attachment, Message};
