//! Wire framing between requesters and the relay worker.
//!
//! Bus payloads are text, so binary content travels base64-encoded next to
//! its name in a single frame. See [`codec`].

pub mod codec;

pub use codec::{Envelope, FrameError};
