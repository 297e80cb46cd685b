//! Protocol core for bridging a caller's audio to a bidirectional
//! speech-to-speech inference stream.
//!
//! - `lifecycle`: the session → prompt → content state machine.
//! - `frame`: outbound and inbound wire events.
//! - `encoder`: builds ordered frame sequences from lifecycle state.
//! - `media`: audio and inference parameters.
//! - `stream`: the transport seam to the remote service.

pub mod encoder;
pub mod frame;
pub mod lifecycle;
pub mod media;
pub mod stream;

pub use encoder::{EventFrameEncoder, ProtocolViolation};
pub use frame::{InboundFrame, OutboundFrame};
pub use lifecycle::SessionLifecycleManager;
pub use stream::{InboundFrames, InferenceError, InferenceStreamClient, OutboundFrames};
