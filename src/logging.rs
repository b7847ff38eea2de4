//! Logging setup
//!
//! Everything written by the fmt layer passes through a redacting writer so
//! Matrix access tokens never reach the logs.

use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use tracing_subscriber::{prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "info";

/// Regex patterns for redacting sensitive data
pub struct RedactionPatterns {
    access_token: Regex,
    query_token: Regex,
    bearer: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            access_token: Regex::new(r"\bsy[tu]_[A-Za-z0-9_-]{10,}")?,
            query_token: Regex::new(r"(access_token=)[^\s&]+")?,
            bearer: Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]+")?,
        })
    }

    /// Mask every secret found in `input`.
    #[must_use]
    pub fn redact(&self, input: &str) -> String {
        let mut output = self
            .access_token
            .replace_all(input, "[MATRIX_TOKEN]")
            .to_string();
        output = self
            .query_token
            .replace_all(&output, "${1}[MASKED]")
            .to_string();
        output = self.bearer.replace_all(&output, "${1}[MASKED]").to_string();
        output
    }
}

/// Writer masking secrets before forwarding to `inner`
pub struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length; the redacted text may differ in size.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `MakeWriter` wrapping another writer factory with redaction
pub struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    /// Wrap `make_inner`.
    pub const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

/// Install the global subscriber writing redacted output to stderr.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`.
pub fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_matrix_tokens() -> Result<(), regex::Error> {
        let patterns = RedactionPatterns::new()?;

        let line = "login ok token=syt_YWxpY2U_KhrWjQoXmZbJyYTvBmnp_0abcd";
        assert_eq!(patterns.redact(line), "login ok token=[MATRIX_TOKEN]");

        let url = "GET /_matrix/client/v3/sync?since=s1&access_token=secret123&timeout=0";
        assert_eq!(
            patterns.redact(url),
            "GET /_matrix/client/v3/sync?since=s1&access_token=[MASKED]&timeout=0"
        );

        let header = "Authorization: Bearer abc.def-ghi";
        assert_eq!(patterns.redact(header), "Authorization: Bearer [MASKED]");
        Ok(())
    }

    #[test]
    fn test_plain_text_untouched() -> Result<(), regex::Error> {
        let patterns = RedactionPatterns::new()?;
        let line = "Text buffered, waiting for media room_id=!r:example.org";
        assert_eq!(patterns.redact(line), line);
        Ok(())
    }

    #[test]
    fn test_writer_reports_original_length() -> Result<(), Box<dyn std::error::Error>> {
        let patterns = Arc::new(RedactionPatterns::new()?);
        let mut out = Vec::new();
        let input = b"access_token=abcdefghijklmnop";

        let written = RedactingWriter::new(&mut out, patterns).write(input)?;

        assert_eq!(written, input.len());
        assert_eq!(String::from_utf8(out)?, "access_token=[MASKED]");
        Ok(())
    }
}
