//! URL templates with `{name}` placeholders.

use std::fmt::Write as _;

use fluxion_types::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder(String),
}

/// A parsed URL template. Parsing happens once at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for unbalanced braces or empty placeholders.
    pub fn parse(source: &str) -> Result<Self, ConfigurationError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = source.char_indices();
        while let Some((at, c)) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => break,
                            other => name.push(other),
                        }
                    }
                    if !closed {
                        return Err(malformed(source, format!("unclosed '{{' at offset {at}")));
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(malformed(source, format!("empty placeholder at offset {at}")));
                    }
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Placeholder(name.to_string()));
                }
                '}' => {
                    return Err(malformed(source, format!("unmatched '}}' at offset {at}")));
                }
                other => text.push(other),
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// Substitute every placeholder with the percent-encoded value returned
    /// by `resolve`. The first placeholder that resolves to `None` is returned
    /// as the error.
    ///
    /// # Errors
    ///
    /// Returns the name of the first unresolved placeholder.
    pub fn render<F>(&self, mut resolve: F) -> Result<String, String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = resolve(name).ok_or_else(|| name.clone())?;
                    percent_encode_into(&value, &mut out);
                }
            }
        }
        Ok(out)
    }
}

fn malformed(source: &str, detail: String) -> ConfigurationError {
    ConfigurationError::new(
        "MALFORMED_TEMPLATE",
        format!("url template '{source}': {detail}"),
    )
}

/// Encode everything outside the RFC 3986 unreserved set.
fn percent_encode_into(value: &str, out: &mut String) {
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
}
