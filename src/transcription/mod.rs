/// Model download and management
pub mod download;
/// Whisper model inference engine
pub mod engine;
/// Single-flight lazy model loading
pub mod loader;

pub use download::ensure_model_downloaded;
pub use engine::{
    Segment, TranscribeOptions, Transcriber, Transcript, TranscriptionEngine, TranscriptionError,
    WhisperModelFactory,
};
pub use loader::{LoadError, LoadStatus, ResourceFactory, ResourceLoader};

/// Loader for the process-wide speech-recognition model
pub type ModelLoader = ResourceLoader<dyn Transcriber>;
