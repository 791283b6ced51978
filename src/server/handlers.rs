use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::error::ApiError;
use super::languages::{self, LanguagesResponse, AUTO_DETECT};
use super::AppState;
use crate::audio::{self, AudioError};
use crate::transcription::{Segment, TranscribeOptions, TranscriptionError};
use crate::uploads::TempUpload;

/// Multipart part names accepted for the audio payload
const AUDIO_FIELDS: &[&str] = &["file", "audio"];

/// Declared content types for headerless 16-bit PCM bodies
const RAW_PCM_TYPES: &[&str] = &["audio/l16", "audio/pcm", "audio/raw"];

/// Body of `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `healthy` while the process serves requests
    pub status: &'static str,
    /// Configured model size/variant
    pub model: String,
    /// Configured execution device
    pub device: &'static str,
    /// `unloaded`, `loading` or `loaded`
    pub model_state: &'static str,
    /// RFC 3339 UTC time of the response
    pub timestamp: String,
}

/// Query string of `POST /transcribe`
#[derive(Debug, Default, Deserialize)]
pub struct TranscribeQuery {
    /// Language code or `auto`
    pub language: Option<String>,
}

/// Body of a successful `POST /transcribe`
#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    /// Always true
    pub success: bool,
    /// Full transcript
    pub text: String,
    /// Timestamped segments
    pub segments: Vec<Segment>,
    /// Language used or detected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Detection confidence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_probability: Option<f32>,
    /// Audio duration in seconds
    pub duration: f64,
    /// Wall time spent on this request in seconds
    pub processing_time: f64,
}

/// Audio and form fields pulled out of the request body
#[derive(Debug, Default)]
struct AudioUpload {
    bytes: Bytes,
    content_type: Option<String>,
    language: Option<String>,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model: state.settings.model_name.clone(),
        device: state.settings.device.as_str(),
        model_state: state.loader.status().as_str(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `GET /languages`
pub async fn languages(State(state): State<AppState>) -> Json<LanguagesResponse> {
    Json(languages::catalog(&state.settings.default_language))
}

/// `POST /transcribe`
///
/// # Errors
/// 400 when no audio or an invalid language is supplied; 500 when the model
/// cannot be loaded, the audio cannot be decoded, or inference fails or times out
pub async fn transcribe(
    State(state): State<AppState>,
    Query(query): Query<TranscribeQuery>,
    request: Request,
) -> Result<Json<TranscribeResponse>, ApiError> {
    let started = Instant::now();

    let upload = read_upload(request).await?;
    if upload.bytes.is_empty() {
        return Err(ApiError::InvalidRequest("No audio data provided".to_owned()));
    }

    // Query parameter wins over the form field
    let language = resolve_language(
        query.language.or(upload.language),
        &state.settings.default_language,
    )?;
    let (wav, extension) = prepare_audio(upload.bytes, upload.content_type.as_deref())?;

    let temp = TempUpload::create(&state.settings.upload_dir, &wav, extension).await?;

    tracing::info!(
        bytes = wav.len(),
        language = language.as_deref().unwrap_or(AUTO_DETECT),
        "transcribing audio"
    );

    let model = state.loader.acquire().await?;

    let path = temp.path().to_path_buf();
    let options = TranscribeOptions::new(language);
    // Fires on timeout and on client disconnect, so an abandoned job stops early
    let _cancel_on_exit = options.cancel.clone().drop_guard();
    let job = tokio::task::spawn_blocking(move || model.transcribe_file(&path, &options));

    let timeout = state.settings.transcribe_timeout;
    let transcript = match tokio::time::timeout(timeout, job).await {
        Ok(Ok(result)) => result?,
        Ok(Err(join_error)) => {
            return Err(anyhow::anyhow!("transcription task failed: {join_error}").into())
        }
        Err(_) => return Err(ApiError::Timeout(timeout)),
    };
    drop(temp);

    let text = transcript.text();
    let processing_time = started.elapsed().as_secs_f64();

    tracing::info!(
        processing_ms = started.elapsed().as_millis(),
        segments = transcript.segments.len(),
        "transcription complete: {}",
        text.chars().take(100).collect::<String>()
    );

    Ok(Json(TranscribeResponse {
        success: true,
        text,
        segments: transcript.segments,
        language: transcript.language,
        language_probability: transcript.language_probability,
        duration: transcript.duration,
        processing_time,
    }))
}

/// Pull audio out of a multipart form or a raw body
async fn read_upload(request: Request) -> Result<AudioUpload, ApiError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let is_multipart = content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if !is_multipart {
        let bytes = Bytes::from_request(request, &())
            .await
            .map_err(|rejection| ApiError::Rejected {
                status: rejection.status(),
                message: rejection.body_text(),
            })?;
        return Ok(AudioUpload {
            bytes,
            content_type,
            language: None,
        });
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|rejection| ApiError::Rejected {
            status: rejection.status(),
            message: rejection.body_text(),
        })?;

    let mut upload = AudioUpload::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_owned();
        if AUDIO_FIELDS.contains(&name.as_str()) && upload.bytes.is_empty() {
            upload.content_type = field.content_type().map(str::to_owned);
            upload.bytes = field.bytes().await.map_err(multipart_error)?;
        } else if name == "language" {
            upload.language = Some(field.text().await.map_err(multipart_error)?);
        }
    }

    Ok(upload)
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::Rejected {
        status: e.status(),
        message: e.body_text(),
    }
}

/// Normalize a language hint; `None` means auto-detect
fn resolve_language(requested: Option<String>, default: &str) -> Result<Option<String>, ApiError> {
    let requested = requested
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| default.to_owned());

    match languages::normalize_code(&requested) {
        Some(code) if code == AUTO_DETECT => Ok(None),
        Some(code) => Ok(Some(code)),
        None => Err(ApiError::InvalidRequest(format!(
            "Invalid language code: {}",
            requested.trim()
        ))),
    }
}

/// Produce the bytes to materialize and their file extension
///
/// WAV passes through, declared raw PCM is wrapped in a WAV header, anything
/// else is stored as-is and left for the decoder to reject.
fn prepare_audio(bytes: Bytes, content_type: Option<&str>) -> Result<(Bytes, &'static str), ApiError> {
    if audio::is_riff(&bytes) {
        return Ok((bytes, "wav"));
    }

    let declared_pcm = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .is_some_and(|ct| RAW_PCM_TYPES.contains(&ct.as_str()));

    if declared_pcm {
        let wav = audio::wrap_pcm_s16le(&bytes).map_err(invalid_audio)?;
        return Ok((Bytes::from(wav), "wav"));
    }

    Ok((bytes, "bin"))
}

fn invalid_audio(e: AudioError) -> ApiError {
    ApiError::Transcription(TranscriptionError::InvalidAudio(e))
}
