use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Sample rate expected by Whisper
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Errors raised while turning uploaded bytes into samples
#[derive(Debug, Error)]
pub enum AudioError {
    /// Container could not be parsed
    #[error("failed to decode WAV audio: {0}")]
    Wav(#[from] hound::Error),

    /// Audio file could not be opened
    #[error("failed to open audio file: {0}")]
    Io(#[from] std::io::Error),

    /// Header describes a layout we cannot process
    #[error("unsupported audio layout: {0}")]
    Unsupported(String),

    /// Container held no samples
    #[error("audio contains no samples")]
    Empty,
}

/// Returns true if `bytes` starts with a RIFF/WAVE header
#[must_use]
pub fn is_riff(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Reads a WAV file from disk and converts it to 16kHz mono
///
/// # Errors
/// Returns error if the file cannot be opened or is not a usable WAV file
pub fn read_wav_file(path: &Path) -> Result<Vec<f32>, AudioError> {
    let file = File::open(path)?;
    decode_wav(BufReader::new(file))
}

/// Decodes a WAV stream (int 8/16/24/32-bit or float) into 16kHz mono samples
///
/// # Errors
/// Returns error if the header is invalid, the layout is unsupported, or no samples are present
#[allow(clippy::cast_precision_loss)] // integer PCM → f32 normalization
pub fn decode_wav<R: Read>(reader: R) -> Result<Vec<f32>, AudioError> {
    let mut reader = WavReader::new(reader)?;
    let spec = reader.spec();

    if spec.channels == 0 {
        return Err(AudioError::Unsupported("zero channels".to_owned()));
    }
    if spec.sample_rate == 0 {
        return Err(AudioError::Unsupported("zero sample rate".to_owned()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(AudioError::Unsupported(format!(
                    "{}-bit integer samples",
                    spec.bits_per_sample
                )));
            }
            // Full-scale value for the declared bit depth
            let scale = (1_u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    if interleaved.is_empty() {
        return Err(AudioError::Empty);
    }

    debug!(
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        bits = spec.bits_per_sample,
        samples = interleaved.len(),
        "decoded WAV upload"
    );

    let mono = downmix(&interleaved, spec.channels);
    Ok(resample_linear(&mono, spec.sample_rate, TARGET_SAMPLE_RATE))
}

/// Wraps headerless 16-bit little-endian mono PCM at 16kHz in a WAV container
///
/// A trailing odd byte is ignored.
///
/// # Errors
/// Returns error if fewer than two bytes are supplied or the container cannot be written
pub fn wrap_pcm_s16le(bytes: &[u8]) -> Result<Vec<u8>, AudioError> {
    if bytes.len() < 2 {
        return Err(AudioError::Empty);
    }

    let spec = WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(bytes.len() + 44));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for pair in bytes.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Averages interleaved frames into a single channel
fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let channels_f64 = f64::from(channels);
    samples
        .chunks(usize::from(channels))
        .map(|frame| {
            let sum_f64: f64 = frame.iter().map(|&s| f64::from(s)).sum();
            // f64 → f32: audio samples are stored as f32, precision sufficient
            #[allow(clippy::cast_possible_truncation)]
            {
                (sum_f64 / channels_f64) as f32
            }
        })
        .collect()
}

/// Simple linear interpolation resampling
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    // Algorithm requires f64 ↔ usize conversions for fractional index calculations
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    {
        let ratio = f64::from(from_rate) / f64::from(to_rate);
        let output_len = ((samples.len() as f64) / ratio).ceil() as usize;
        let last = samples.len() - 1;

        let mut resampled = Vec::with_capacity(output_len);
        for i in 0..output_len {
            let src_idx_f64 = (i as f64) * ratio;
            let src_idx_floor = (src_idx_f64.floor() as usize).min(last);
            let src_idx_ceil = (src_idx_floor + 1).min(last);
            let fract = src_idx_f64 - src_idx_f64.floor();

            let s1 = f64::from(samples[src_idx_floor]);
            let s2 = f64::from(samples[src_idx_ceil]);
            resampled.push(s1.mul_add(1.0 - fract, s2 * fract) as f32);
        }

        debug!(
            from_rate,
            to_rate,
            input_samples = samples.len(),
            output_samples = resampled.len(),
            "resampling completed"
        );

        resampled
    }
}
