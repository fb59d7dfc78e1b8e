//! Session runtime
//!
//! Infrastructure shared by the SMTP and POP3 servers: the unified
//! plain/TLS stream, bounded line reading, dot-stuffed body framing, the
//! connection admission gate, and the accept loop with cooperative
//! shutdown. One tokio task per connection; a slow client holds nothing
//! another session needs.

pub mod gate;
pub mod line;
pub mod listener;
pub mod stream;

pub use gate::{ConnectionGate, ConnectionPermit};
pub use line::{dot_stuff, dot_unstuff_line, read_frame_line, trim_line_ending, LineLimits};
pub use listener::{ListenerSettings, MailListener, ShutdownHandle};
pub use stream::{AsyncStream, MailStream};
