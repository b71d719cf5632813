//! Error types grouped by the layer that produces them.
//!
//! The codec errors ([`ParseError`], [`FrameError`]) are plain enums so the
//! parsers stay allocation free and easy to audit. [`ProbeError`] is the
//! application level taxonomy everything above the codecs reports through.

mod parse_error;
pub use parse_error::*;

mod frame_error;
pub use frame_error::*;

mod probe_error;
pub use probe_error::*;
