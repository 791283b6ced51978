use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState,
    WhisperVadParams,
};

use crate::audio::{self, AudioError, TARGET_SAMPLE_RATE};
use crate::config::{Config, Device, ModelConfig};
use crate::transcription::download::ensure_model_downloaded;
use crate::transcription::loader::ResourceFactory;

/// Errors that can occur during transcription
#[derive(Debug, Error)]
pub enum TranscriptionError {
    /// Failed to load Whisper model
    #[error("failed to load whisper model from {path}: {source}")]
    ModelLoad {
        /// Path to model file
        path: String,
        /// Underlying error
        source: anyhow::Error,
    },

    /// Failed to create Whisper inference state
    #[error("failed to create whisper state")]
    StateCreation,

    /// Uploaded audio could not be decoded
    #[error("invalid audio: {0}")]
    InvalidAudio(#[from] AudioError),

    /// Transcription inference failed
    #[error("failed to transcribe audio: {0:#}")]
    Transcription(#[from] anyhow::Error),

    /// The caller stopped waiting before inference finished
    #[error("transcription cancelled")]
    Cancelled,
}

/// Per-request decoding options
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    /// Language code; `None` lets the model detect it
    pub language: Option<String>,
    /// Set once nobody is waiting for the result
    pub cancel: CancellationToken,
}

impl TranscribeOptions {
    /// Options for one request with the given language hint
    #[must_use]
    pub fn new(language: Option<String>) -> Self {
        Self {
            language,
            cancel: CancellationToken::new(),
        }
    }

    /// Error out early once the caller has gone away
    ///
    /// # Errors
    /// Returns [`TranscriptionError::Cancelled`] if the token was cancelled
    pub fn check_cancelled(&self) -> Result<(), TranscriptionError> {
        if self.cancel.is_cancelled() {
            Err(TranscriptionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A time-bounded span of decoded text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    /// Start offset in seconds
    pub start: f64,
    /// End offset in seconds
    pub end: f64,
    /// Trimmed segment text
    pub text: String,
}

/// Decoder output for one audio buffer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    /// Decoded segments in order
    pub segments: Vec<Segment>,
    /// Language used or detected
    pub language: Option<String>,
    /// Detection confidence, when the backend reports one
    pub language_probability: Option<f32>,
    /// Audio duration in seconds
    pub duration: f64,
}

impl Transcript {
    /// Full transcript: non-empty segment texts joined by single spaces
    #[must_use]
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Speech-to-text backend shared by all request handlers
///
/// Implementations must be safe to call from several blocking threads; the
/// Whisper engine serializes inference internally.
#[cfg_attr(test, mockall::automock)]
pub trait Transcriber: Send + Sync {
    /// Transcribe 16kHz mono samples
    ///
    /// # Errors
    /// Returns error if inference fails
    fn transcribe(
        &self,
        audio_data: &[f32],
        options: &TranscribeOptions,
    ) -> Result<Transcript, TranscriptionError>;

    /// Transcribe a WAV file on disk
    ///
    /// # Errors
    /// Returns error if the file is not decodable audio or inference fails
    fn transcribe_file(
        &self,
        path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Transcript, TranscriptionError> {
        options.check_cancelled()?;
        let samples = audio::read_wav_file(path)?;
        self.transcribe(&samples, options)
    }
}

/// Voice-activity filtering applied before decoding
#[derive(Debug, Clone)]
struct VadSettings {
    model_path: String,
    min_silence_ms: i32,
}

/// Whisper transcription engine
pub struct TranscriptionEngine {
    /// Whisper context, locked for the whole of each inference
    ctx: Mutex<WhisperContext>,
    /// Number of CPU threads for inference
    threads: i32,
    /// Beam search width
    beam_size: i32,
    /// Silero VAD, when configured
    vad: Option<VadSettings>,
}

impl TranscriptionEngine {
    /// Determines sampling strategy based on beam size (pure, testable)
    const fn get_sampling_strategy(beam_size: i32) -> SamplingStrategy {
        if beam_size > 1 {
            SamplingStrategy::BeamSearch {
                beam_size,
                patience: -1.0,
            }
        } else {
            SamplingStrategy::Greedy { best_of: 1 }
        }
    }

    /// Creates a new `TranscriptionEngine` by loading the model from the given path
    ///
    /// # Errors
    /// Returns error if model file doesn't exist, is invalid, or if `threads`/`beam_size` are zero or exceed `i32::MAX`
    pub fn new(
        model_path: &Path,
        threads: usize,
        beam_size: usize,
        device: Device,
    ) -> Result<Self, TranscriptionError> {
        let load_error = |source: anyhow::Error| TranscriptionError::ModelLoad {
            path: model_path.display().to_string(),
            source,
        };

        if threads == 0 {
            return Err(load_error(anyhow::anyhow!("threads must be > 0")));
        }
        if beam_size == 0 {
            return Err(load_error(anyhow::anyhow!("beam_size must be > 0")));
        }

        // whisper-rs takes i32 for both
        let threads_i32 = i32::try_from(threads)
            .map_err(|_| load_error(anyhow::anyhow!("threads value too large (max: {})", i32::MAX)))?;
        let beam_size_i32 = i32::try_from(beam_size).map_err(|_| {
            load_error(anyhow::anyhow!("beam_size value too large (max: {})", i32::MAX))
        })?;

        tracing::info!(
            path = %model_path.display(),
            threads,
            beam_size,
            device = device.as_str(),
            "loading whisper model"
        );

        let path_str = model_path
            .to_str()
            .ok_or_else(|| load_error(anyhow::anyhow!("model path contains invalid UTF-8")))?;

        let mut params = WhisperContextParameters::default();
        params.use_gpu(device.use_gpu());
        let ctx = WhisperContext::new_with_params(path_str, params)
            .map_err(|e| load_error(anyhow::anyhow!("{e:?}")))?;

        tracing::info!("whisper model loaded successfully");

        Ok(Self {
            ctx: Mutex::new(ctx),
            threads: threads_i32,
            beam_size: beam_size_i32,
            vad: None,
        })
    }

    /// Skip non-speech with a Silero VAD model before decoding
    ///
    /// # Errors
    /// Returns error if the VAD model is missing, its path is not UTF-8, or
    /// `min_silence_ms` exceeds `i32::MAX`
    pub fn with_vad(mut self, model_path: &Path, min_silence_ms: u32) -> Result<Self, TranscriptionError> {
        let vad_error = |source: anyhow::Error| TranscriptionError::ModelLoad {
            path: model_path.display().to_string(),
            source,
        };

        if !model_path.exists() {
            return Err(vad_error(anyhow::anyhow!("VAD model file not found")));
        }
        let path = model_path
            .to_str()
            .ok_or_else(|| vad_error(anyhow::anyhow!("VAD model path contains invalid UTF-8")))?;
        let min_silence_ms = i32::try_from(min_silence_ms)
            .map_err(|_| vad_error(anyhow::anyhow!("vad_min_silence_ms too large")))?;

        tracing::info!(path, min_silence_ms, "voice activity detection enabled");
        self.vad = Some(VadSettings {
            model_path: path.to_owned(),
            min_silence_ms,
        });
        Ok(self)
    }

    /// Probability the detector assigned to `lang_id` on the first window
    fn detection_probability(state: &WhisperState, lang_id: i32, threads: i32) -> Option<f32> {
        let threads = usize::try_from(threads).unwrap_or(1);
        match state.lang_detect(0, threads) {
            Ok((_, probs)) => usize::try_from(lang_id)
                .ok()
                .and_then(|i| probs.get(i).copied()),
            Err(e) => {
                tracing::warn!("language probability unavailable: {e:?}");
                None
            }
        }
    }

    fn transcribe_impl(
        &self,
        audio_data: &[f32],
        options: &TranscribeOptions,
    ) -> Result<Transcript, TranscriptionError> {
        let _span = tracing::debug_span!("transcription", samples = audio_data.len()).entered();
        options.check_cancelled()?;

        // Held until inference finishes: one transcription at a time
        let ctx = self
            .ctx
            .lock()
            .map_err(|e| anyhow::anyhow!("mutex poisoned: {e}"))?;
        // The caller may have timed out while this job queued on the lock
        options.check_cancelled()?;
        let mut state = ctx
            .create_state()
            .map_err(|_| TranscriptionError::StateCreation)?;

        let strategy = Self::get_sampling_strategy(self.beam_size);
        let mut params = FullParams::new(strategy);
        params.set_n_threads(self.threads);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_language(Some(options.language.as_deref().unwrap_or("auto")));
        params.set_translate(false);

        if let Some(vad) = &self.vad {
            let mut vad_params = WhisperVadParams::new();
            vad_params.set_min_silence_duration(vad.min_silence_ms);
            params.enable_vad(true);
            params.set_vad_model_path(Some(vad.model_path.as_str()));
            params.set_vad_params(vad_params);
        }

        let cancel = options.cancel.clone();
        params.set_abort_callback_safe(move || cancel.is_cancelled());

        let start = std::time::Instant::now();
        let outcome = state.full(params, audio_data);
        options.check_cancelled()?;
        outcome.context("whisper inference failed")?;
        let inference_duration = start.elapsed();

        // Timestamps are reported in centiseconds
        #[allow(clippy::cast_precision_loss)]
        let segments: Vec<Segment> = state
            .as_iter()
            .map(|segment| Segment {
                start: segment.start_timestamp() as f64 / 100.0,
                end: segment.end_timestamp() as f64 / 100.0,
                text: segment.to_string().trim().to_owned(),
            })
            .collect();

        let (language, language_probability) = match &options.language {
            Some(hint) => (Some(hint.clone()), None),
            None => {
                let lang_id = state.full_lang_id_from_state();
                (
                    whisper_rs::get_lang_str(lang_id).map(str::to_owned),
                    Self::detection_probability(&state, lang_id, self.threads),
                )
            }
        };
        drop(state);
        drop(ctx);

        #[allow(clippy::cast_precision_loss)]
        let duration = audio_data.len() as f64 / f64::from(TARGET_SAMPLE_RATE);

        tracing::info!(
            segments = segments.len(),
            language = ?language,
            language_probability = ?language_probability,
            audio_secs = duration,
            inference_ms = inference_duration.as_millis(),
            "transcription completed"
        );

        Ok(Transcript {
            segments,
            language,
            language_probability,
            duration,
        })
    }
}

impl Transcriber for TranscriptionEngine {
    fn transcribe(
        &self,
        audio_data: &[f32],
        options: &TranscribeOptions,
    ) -> Result<Transcript, TranscriptionError> {
        self.transcribe_impl(audio_data, options)
    }
}

// SAFETY: TranscriptionEngine is thread-safe because:
// 1. WhisperContext is wrapped in a Mutex, ensuring exclusive access
// 2. Every inference holds the lock from state creation until results are collected
// 3. No shared mutable state exists outside the mutex
#[allow(unsafe_code)]
unsafe impl Send for TranscriptionEngine {}
#[allow(unsafe_code)]
unsafe impl Sync for TranscriptionEngine {}

/// Builds the Whisper engine for the configured model, fetching weights if needed
pub struct WhisperModelFactory {
    config: ModelConfig,
    model_path: PathBuf,
    label: String,
}

impl WhisperModelFactory {
    /// Resolves the weight path for `config`
    ///
    /// # Errors
    /// Returns error if the model directory cannot be expanded
    pub fn new(config: ModelConfig) -> Result<Self> {
        let model_path = config.model_path()?;
        let label = format!("whisper model '{}'", config.name);
        Ok(Self {
            config,
            model_path,
            label,
        })
    }

    /// Location of the weight file
    #[must_use]
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

impl ResourceFactory<dyn Transcriber> for WhisperModelFactory {
    fn name(&self) -> &str {
        &self.label
    }

    fn create(&self) -> Result<Arc<dyn Transcriber>> {
        if self.config.download {
            ensure_model_downloaded(&self.config.file_name(), &self.model_path)?;
        } else if !self.model_path.exists() {
            anyhow::bail!(
                "model file not found at {} (downloads disabled)",
                self.model_path.display()
            );
        }

        let mut engine = TranscriptionEngine::new(
            &self.model_path,
            self.config.threads,
            self.config.beam_size,
            self.config.device,
        )?;
        if let Some(vad_model) = &self.config.vad_model {
            let vad_path = Config::expand_path(vad_model)?;
            engine = engine.with_vad(&vad_path, self.config.vad_min_silence_ms)?;
        }
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
#[allow(clippy::print_stderr)] // Test diagnostics
mod tests {
    use super::*;

    fn get_test_model_path() -> Option<PathBuf> {
        let home = std::env::var("HOME").ok()?;
        let path = PathBuf::from(home)
            .join(".whisper-service")
            .join("models")
            .join("ggml-tiny.bin");

        if path.exists() {
            Some(path)
        } else {
            None
        }
    }

    fn segment(start: f64, end: f64, text: &str) -> Segment {
        Segment {
            start,
            end,
            text: text.to_owned(),
        }
    }

    #[test]
    fn test_transcript_text_joins_segments() {
        let transcript = Transcript {
            segments: vec![
                segment(0.0, 1.0, " hello"),
                segment(1.0, 2.0, ""),
                segment(2.0, 3.0, "world "),
            ],
            ..Transcript::default()
        };
        assert_eq!(transcript.text(), "hello world");
    }

    #[test]
    fn test_transcript_text_empty() {
        assert_eq!(Transcript::default().text(), "");
    }

    #[test]
    fn test_transcribe_file_decodes_then_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        let wav = audio::wrap_pcm_s16le(&[0u8; 3200]).unwrap();
        std::fs::write(&path, wav).unwrap();

        let mut mock = MockTranscriber::new();
        mock.expect_transcribe()
            .withf(|samples, options| samples.len() == 1600 && options.language.is_none())
            .times(1)
            .returning(|_, _| {
                Ok(Transcript {
                    segments: vec![segment(0.0, 0.1, "ok")],
                    ..Transcript::default()
                })
            });

        // Provided method is mocked too; route it through the default implementation
        struct Delegating(MockTranscriber);
        impl Transcriber for Delegating {
            fn transcribe(
                &self,
                audio_data: &[f32],
                options: &TranscribeOptions,
            ) -> Result<Transcript, TranscriptionError> {
                self.0.transcribe(audio_data, options)
            }
        }

        let transcript = Delegating(mock)
            .transcribe_file(&path, &TranscribeOptions::default())
            .unwrap();
        assert_eq!(transcript.text(), "ok");
    }

    #[test]
    fn test_cancelled_options_short_circuit_file_decode() {
        let mut mock = MockTranscriber::new();
        mock.expect_transcribe().never();

        struct Delegating(MockTranscriber);
        impl Transcriber for Delegating {
            fn transcribe(
                &self,
                audio_data: &[f32],
                options: &TranscribeOptions,
            ) -> Result<Transcript, TranscriptionError> {
                self.0.transcribe(audio_data, options)
            }
        }

        let options = TranscribeOptions::new(None);
        assert!(options.check_cancelled().is_ok());

        // Clones share the token, as the handler and the blocking job do
        options.clone().cancel.cancel();
        let result = Delegating(mock).transcribe_file(Path::new("/nonexistent/clip.wav"), &options);
        assert!(matches!(result, Err(TranscriptionError::Cancelled)));
    }

    #[test]
    fn test_transcribe_file_rejects_non_wav() {
        struct Unreachable;
        impl Transcriber for Unreachable {
            fn transcribe(
                &self,
                _audio_data: &[f32],
                _options: &TranscribeOptions,
            ) -> Result<Transcript, TranscriptionError> {
                Err(TranscriptionError::StateCreation)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        std::fs::write(&path, b"ID3 not a wav").unwrap();

        let result = Unreachable.transcribe_file(&path, &TranscribeOptions::default());
        assert!(matches!(result, Err(TranscriptionError::InvalidAudio(_))));
    }

    #[test]
    fn test_model_load_nonexistent_path() {
        let nonexistent_path = Path::new("/tmp/nonexistent_model.bin");
        let result = TranscriptionEngine::new(nonexistent_path, 4, 5, Device::Cpu);

        assert!(matches!(result, Err(TranscriptionError::ModelLoad { .. })));
        if let Err(TranscriptionError::ModelLoad { path, .. }) = result {
            assert!(path.contains("nonexistent_model.bin"));
        }
    }

    #[test]
    fn test_new_with_zero_threads() {
        let result = TranscriptionEngine::new(Path::new("/tmp/dummy.bin"), 0, 5, Device::Auto);
        assert!(matches!(result, Err(TranscriptionError::ModelLoad { .. })));
        if let Err(TranscriptionError::ModelLoad { source, .. }) = result {
            assert!(source.to_string().contains("threads must be > 0"));
        }
    }

    #[test]
    fn test_new_with_zero_beam_size() {
        let result = TranscriptionEngine::new(Path::new("/tmp/dummy.bin"), 4, 0, Device::Auto);
        assert!(matches!(result, Err(TranscriptionError::ModelLoad { .. })));
        if let Err(TranscriptionError::ModelLoad { source, .. }) = result {
            assert!(source.to_string().contains("beam_size must be > 0"));
        }
    }

    #[test]
    fn test_thread_count_overflow() {
        #[cfg(target_pointer_width = "64")]
        {
            let path = Path::new("/tmp/dummy.bin");
            let result = TranscriptionEngine::new(path, (i32::MAX as usize) + 1, 5, Device::Cpu);
            if let Err(TranscriptionError::ModelLoad { source, .. }) = result {
                assert!(source.to_string().contains("threads value too large"));
            } else {
                panic!("expected ModelLoad error");
            }
        }
    }

    #[test]
    fn test_get_sampling_strategy_greedy() {
        let strategy = TranscriptionEngine::get_sampling_strategy(1);
        assert!(matches!(strategy, SamplingStrategy::Greedy { best_of: 1 }));
    }

    #[test]
    fn test_get_sampling_strategy_beam_search() {
        for beam in [2, 5, 10] {
            let strategy = TranscriptionEngine::get_sampling_strategy(beam);
            assert!(
                matches!(strategy, SamplingStrategy::BeamSearch { beam_size, patience } if beam_size == beam && patience < 0.0),
                "Expected BeamSearch with beam_size={beam}"
            );
        }
    }

    #[test]
    fn test_engine_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TranscriptionEngine>();
    }

    #[test]
    fn test_factory_without_download_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            name: "tiny".to_owned(),
            dir: dir.path().display().to_string(),
            download: false,
            ..ModelConfig::default()
        };

        let factory = WhisperModelFactory::new(config).unwrap();
        assert_eq!(factory.name(), "whisper model 'tiny'");
        assert_eq!(factory.model_path(), dir.path().join("ggml-tiny.bin"));

        let err = factory.create().err().unwrap();
        assert!(err.to_string().contains("downloads disabled"));
    }

    #[test]
    #[ignore = "requires actual model file"]
    fn test_transcribe_silence() {
        let Some(model_path) = get_test_model_path() else {
            eprintln!("Skipping test: no model found at ~/.whisper-service/models/ggml-tiny.bin");
            return;
        };

        let engine = TranscriptionEngine::new(&model_path, 4, 5, Device::Auto).unwrap();
        let silence: Vec<f32> = vec![0.0; 16000];

        let transcript = engine
            .transcribe(&silence, &TranscribeOptions::default())
            .unwrap();
        assert!(transcript.text().len() < 50);
        assert!((transcript.duration - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    #[ignore = "requires actual model file"]
    fn test_transcribe_with_language_hint() {
        let Some(model_path) = get_test_model_path() else {
            eprintln!("Skipping test: no model found");
            return;
        };

        let engine = TranscriptionEngine::new(&model_path, 4, 1, Device::Cpu).unwrap();
        let options = TranscribeOptions::new(Some("en".to_owned()));

        let transcript = engine.transcribe(&vec![0.0; 32000], &options).unwrap();
        assert_eq!(transcript.language.as_deref(), Some("en"));
        assert!(transcript.language_probability.is_none());
    }

    #[test]
    #[ignore = "requires actual model file"]
    fn test_auto_detect_reports_probability() {
        let Some(model_path) = get_test_model_path() else {
            eprintln!("Skipping test: no model found");
            return;
        };

        let engine = TranscriptionEngine::new(&model_path, 4, 1, Device::Cpu).unwrap();
        let transcript = engine
            .transcribe(&vec![0.0; 32000], &TranscribeOptions::default())
            .unwrap();

        assert!(transcript.language.is_some());
        let probability = transcript.language_probability.unwrap();
        assert!((0.0..=1.0).contains(&probability), "{probability}");
    }

    #[test]
    #[ignore = "requires actual model file"]
    fn test_cancelled_before_lock_skips_inference() {
        let Some(model_path) = get_test_model_path() else {
            eprintln!("Skipping test: no model found");
            return;
        };

        let engine = TranscriptionEngine::new(&model_path, 4, 1, Device::Cpu).unwrap();
        let options = TranscribeOptions::default();
        options.cancel.cancel();

        let result = engine.transcribe(&vec![0.0; 16000], &options);
        assert!(matches!(result, Err(TranscriptionError::Cancelled)));
    }

    #[test]
    #[ignore = "requires actual model file"]
    fn test_vad_requires_model_file() {
        let Some(model_path) = get_test_model_path() else {
            eprintln!("Skipping test: no model found");
            return;
        };

        let engine = TranscriptionEngine::new(&model_path, 4, 1, Device::Cpu).unwrap();
        let result = engine.with_vad(Path::new("/tmp/nonexistent-silero.bin"), 500);
        assert!(matches!(result, Err(TranscriptionError::ModelLoad { .. })));
    }
}
