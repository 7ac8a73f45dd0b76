//! Sink-level secret masking.
//!
//! Masking happens where bytes leave the process: the tracing writer, the
//! audit sink, and the event append path all run through a [`Masker`]. Call
//! sites never carry masking responsibility and cannot forget it.

use std::io::{self, Write};
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

/// Replacement marker. Fixed so downstream scrapers can key on it.
pub const REDACTED: &str = "***REDACTED***";

/// Field-name denylist, matched case-insensitively and ignoring `_`/`-`
/// separators, so `apiKey`, `api_key`, and `API-KEY` all hit.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "password",
    "passwd",
    "token",
    "api_key",
    "secret",
    "credential",
    "private_key",
    "access_key",
    "auth",
    "bearer",
    "session",
];

#[derive(Clone, Debug)]
pub struct Masker {
    normalised_patterns: Vec<String>,
    kv_pattern: Regex,
    bearer_pattern: Regex,
}

fn normalise(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

impl Masker {
    pub fn new(extra_patterns: &[String]) -> Self {
        let mut patterns: Vec<String> =
            DEFAULT_DENYLIST.iter().map(|pattern| pattern.to_string()).collect();
        patterns.extend(extra_patterns.iter().cloned());

        let alternatives = patterns
            .iter()
            .map(|pattern| regex::escape(pattern))
            .collect::<Vec<_>>()
            .join("|");

        // `password=...`, `token: ...` and friends inside scalar messages.
        // The alternatives are regex-escaped above, so compilation cannot
        // fail on user-supplied patterns.
        let kv_pattern = Regex::new(&format!(
            r#"(?i)\b([a-z0-9_\-]*(?:{alternatives})[a-z0-9_\-]*)(\s*[=:]\s*)("[^"]*"|[^\s,;]+)"#
        ))
        .expect("escaped denylist pattern compiles");

        let bearer_pattern = Regex::new(r"(?i)\b(bearer)\s+([A-Za-z0-9._\-]+)")
            .expect("static bearer pattern compiles");

        let normalised_patterns = patterns.iter().map(|pattern| normalise(pattern)).collect();

        Self { normalised_patterns, kv_pattern, bearer_pattern }
    }

    pub fn field_is_sensitive(&self, name: &str) -> bool {
        let normalised = normalise(name);
        self.normalised_patterns.iter().any(|pattern| normalised.contains(pattern))
    }

    /// Mask `key=value` shapes and bearer tokens inside a scalar message.
    pub fn mask_message(&self, message: &str) -> String {
        let masked = self
            .kv_pattern
            .replace_all(message, |caps: &regex::Captures<'_>| {
                format!("{}{}{}", &caps[1], &caps[2], REDACTED)
            })
            .into_owned();
        self.bearer_pattern
            .replace_all(&masked, |caps: &regex::Captures<'_>| format!("{} {}", &caps[1], REDACTED))
            .into_owned()
    }

    /// Recursively mask a JSON structure in place: denylisted field names are
    /// replaced wholesale, and every remaining string is run through the
    /// scalar masker.
    pub fn mask_json(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.field_is_sensitive(key) {
                        *child = Value::String(REDACTED.to_string());
                    } else {
                        self.mask_json(child);
                    }
                }
            }
            Value::Array(items) => {
                for child in items.iter_mut() {
                    self.mask_json(child);
                }
            }
            Value::String(text) => {
                let masked = self.mask_message(text);
                if masked != *text {
                    *text = masked;
                }
            }
            _ => {}
        }
    }

    /// Convenience for callers that hold an immutable value.
    pub fn masked(&self, value: &Value) -> Value {
        let mut copy = value.clone();
        self.mask_json(&mut copy);
        copy
    }
}

impl Default for Masker {
    fn default() -> Self {
        Self::new(&[])
    }
}

/// `io::Write` wrapper that masks everything flowing through it. Installed
/// around the tracing subscriber's writer so the log sink is masked no
/// matter what a call site formats.
pub struct MaskingWriter<W: Write> {
    inner: W,
    masker: Arc<Masker>,
}

impl<W: Write> MaskingWriter<W> {
    pub fn new(inner: W, masker: Arc<Masker>) -> Self {
        Self { inner, masker }
    }
}

impl<W: Write> Write for MaskingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let masked = self.masker.mask_message(&text);
        self.inner.write_all(masked.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use proptest::prelude::*;
    use serde_json::json;

    use super::{Masker, MaskingWriter, REDACTED};

    #[test]
    fn key_value_shapes_in_messages_are_masked() {
        let masker = Masker::default();
        let masked = masker.mask_message("login failed: password=P@ss123 token=abc");

        assert_eq!(masked, format!("login failed: password={REDACTED} token={REDACTED}"));
        assert!(!masked.contains("P@ss123"));
        assert!(!masked.contains("=abc"));
    }

    #[test]
    fn bearer_tokens_are_masked() {
        let masker = Masker::default();
        let masked = masker.mask_message("header Authorization: Bearer eyJhbGciOi.payload");
        assert!(masked.contains(&format!("Bearer {REDACTED}")));
        assert!(!masked.contains("eyJhbGciOi"));
    }

    #[test]
    fn denylisted_fields_are_masked_recursively() {
        let masker = Masker::default();
        let mut payload = json!({
            "host": "server-01",
            "apiKey": "key-123",
            "connection": {
                "db_password": "hunter2",
                "port": 5432,
                "nested": [{ "access-key": "AKIA999" }]
            }
        });

        masker.mask_json(&mut payload);

        assert_eq!(payload["apiKey"], REDACTED);
        assert_eq!(payload["connection"]["db_password"], REDACTED);
        assert_eq!(payload["connection"]["nested"][0]["access-key"], REDACTED);
        assert_eq!(payload["connection"]["port"], 5432);
        assert_eq!(payload["host"], "server-01");
    }

    #[test]
    fn string_values_are_scanned_even_under_benign_keys() {
        let masker = Masker::default();
        let mut payload = json!({ "detail": "retry with session=sess-42 next time" });
        masker.mask_json(&mut payload);
        assert_eq!(payload["detail"], format!("retry with session={REDACTED} next time"));
    }

    #[test]
    fn installer_extensions_join_the_denylist() {
        let masker = Masker::new(&["pin_code".to_string()]);
        let mut payload = json!({ "pinCode": "0000", "note": "pin_code=1234" });
        masker.mask_json(&mut payload);
        assert_eq!(payload["pinCode"], REDACTED);
        assert_eq!(payload["note"], format!("pin_code={REDACTED}"));
    }

    #[test]
    fn masking_writer_scrubs_the_byte_stream() {
        let masker = Arc::new(Masker::default());
        let mut sink = Vec::new();
        {
            let mut writer = MaskingWriter::new(&mut sink, masker);
            writer
                .write_all(b"step failed: credential=svc-acct-pw-9 exit=1\n")
                .expect("write should succeed");
            writer.flush().expect("flush should succeed");
        }

        let written = String::from_utf8(sink).expect("utf8");
        assert!(written.contains(&format!("credential={REDACTED}")));
        assert!(!written.contains("svc-acct-pw-9"));
        assert!(written.contains("exit=1"));
    }

    proptest! {
        /// No denylisted field survives masking with its original value, for
        /// any value shape placed under it.
        #[test]
        fn denylisted_fields_never_leak(
            key_index in 0usize..super::DEFAULT_DENYLIST.len(),
            secret in "[A-Za-z0-9@!]{6,20}",
        ) {
            let masker = Masker::default();
            let key = super::DEFAULT_DENYLIST[key_index];
            let mut payload = json!({ key: secret.clone(), "plain": "visible" });

            masker.mask_json(&mut payload);

            let rendered = payload.to_string();
            prop_assert!(!rendered.contains(&secret));
            prop_assert!(rendered.contains(REDACTED));
            prop_assert!(rendered.contains("visible"));
        }
    }
}
