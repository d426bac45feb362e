//! Live recording sessions.

pub mod archive;
pub mod controller;
pub mod status;
mod translation;

pub use controller::{SessionController, SessionEvent};
pub use status::{
    Marker, RecordingSession, SessionArchive, SessionOptions, SessionState, StartRequest,
    StopReason, TranscriptSegment, TranslatedSegment, TranslationState,
};
