//! Tracing setup, shared by both binaries.
//!
//! Log lines go through a [`Redactor`] writer that strips Arr API keys out
//! of whatever gets formatted, so a copy-pasted log snippet never leaks a
//! credential.

use std::io::{self, Write};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing_subscriber::EnvFilter;

static KEY_PATTERNS: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r"(?i)(apikey=)([^&\s]+)").expect("valid regex"),
        Regex::new(r"(?i)(X-Api-Key[:=]\s*)([A-Za-z0-9_-]+)").expect("valid regex"),
    ]
});

fn redact_secrets(line: &str) -> String {
    let mut redacted = line.to_string();
    for pattern in KEY_PATTERNS.iter() {
        redacted = pattern.replace_all(&redacted, "$1***").into_owned();
    }
    redacted
}

/// A [`std::io::Write`] sink that redacts secrets before handing lines to
/// stderr. `tracing-subscriber` buffers a full formatted line per write call
/// when used as a `MakeWriter`, so redacting per-write is enough.
struct Redactor;

impl Write for Redactor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let redacted = redact_secrets(&text);
        io::stderr().write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

#[derive(Clone, Copy, Default)]
struct RedactorMakeWriter;

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RedactorMakeWriter {
    type Writer = Redactor;

    fn make_writer(&'a self) -> Self::Writer {
        Redactor
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` wins if set; otherwise
/// falls back to `level` (the configured `app.log_level`).
pub fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactorMakeWriter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_query_string_api_key() {
        let line = "GET /api/movie?apikey=deadbeef1234 200 OK";
        assert_eq!(redact_secrets(line), "GET /api/movie?apikey=*** 200 OK");
    }

    #[test]
    fn redacts_header_style_api_key_case_insensitively() {
        let line = "sent X-Api-Key: AbC123_-xyz to upstream";
        assert_eq!(redact_secrets(line), "sent X-Api-Key: *** to upstream");
    }

    #[test]
    fn leaves_unrelated_text_untouched() {
        let line = "instance radarr:1 triggered search for movie:42";
        assert_eq!(redact_secrets(line), line);
    }
}
