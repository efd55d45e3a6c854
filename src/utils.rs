use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNSAFE_NAME_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._-]+").unwrap();
}

pub const IMAGE_PREFIX: &str = "complaint-images";

/// Trimmed text, or `None` when nothing is left.
pub fn non_blank(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned = UNSAFE_NAME_CHARS.replace_all(base.trim(), "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Blob name for an uploaded complaint image.
pub fn image_object_name(file_name: &str, now: DateTime<Utc>) -> String {
    format!(
        "{IMAGE_PREFIX}/{}-{}",
        now.timestamp_millis(),
        sanitize_file_name(file_name)
    )
}

/// Truncates to `n` characters, appending an ellipsis when cut.
pub fn shorten(text: &str, n: usize) -> String {
    if text.chars().count() > n {
        let mut cut: String = text.chars().take(n).collect();
        cut.push('…');
        cut
    } else {
        text.to_string()
    }
}
