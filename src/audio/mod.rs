/// Uploaded audio decoding to 16kHz mono samples
pub mod decode;

pub use decode::{decode_wav, is_riff, read_wav_file, wrap_pcm_s16le, AudioError, TARGET_SAMPLE_RATE};
