//! Whisper Subtitle Service - HTTP speech-to-text backed by whisper.cpp
//!
//! This library exports the service modules so the binary and integration tests share them.

/// Uploaded audio decoding
pub mod audio;
/// Configuration management
pub mod config;
/// HTTP routes and error mapping
pub mod server;
/// Logging setup
pub mod telemetry;
/// Model loading and Whisper inference
pub mod transcription;
/// Per-request temporary files
pub mod uploads;
