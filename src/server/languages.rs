use serde::Serialize;
use std::collections::BTreeMap;

/// Language hint meaning "let the model detect it"
pub const AUTO_DETECT: &str = "auto";

/// Codes advertised by `GET /languages`
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("en", "English"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("de", "German"),
    ("it", "Italian"),
    ("pt", "Portuguese"),
    ("ru", "Russian"),
    ("zh", "Chinese"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("ar", "Arabic"),
    ("hi", "Hindi"),
    (AUTO_DETECT, "Auto-detect"),
];

/// Body of `GET /languages`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LanguagesResponse {
    /// Code → display name
    pub languages: BTreeMap<&'static str, &'static str>,
    /// Language applied when a request carries none
    pub default: String,
}

/// Lowercased code if it is `auto` or 2–3 ASCII letters
#[must_use]
pub fn normalize_code(code: &str) -> Option<String> {
    let code = code.trim().to_ascii_lowercase();
    let well_formed =
        code == AUTO_DETECT || ((2..=3).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_lowercase()));
    well_formed.then_some(code)
}

/// Static catalog; independent of model state
#[must_use]
pub fn catalog(default_language: &str) -> LanguagesResponse {
    LanguagesResponse {
        languages: SUPPORTED_LANGUAGES.iter().copied().collect(),
        default: default_language.to_owned(),
    }
}
