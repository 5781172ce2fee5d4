pub mod bytes;
pub mod http_request;
pub mod http_response;
pub mod http_stream;

use std::collections::HashMap;

use percent_encoding::percent_decode_str;

/// A structured header value: `main-value; key=value; key="quoted value"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderChild {
    /// Main value, lowercased (`form-data`, `multipart/form-data`).
    pub value: String,
    /// Parameters keyed by lowercased name. The first occurrence wins.
    pub params: HashMap<String, String>,
}

impl HeaderChild {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }
}

pub trait GetHeaderChild {
    fn get_header_child(&self) -> HeaderChild;
}

impl GetHeaderChild for &str {
    fn get_header_child(&self) -> HeaderChild {
        let mut segments = split_params(self).into_iter();
        let value = segments
            .next()
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();

        let mut params = HashMap::new();
        for segment in segments {
            let segment = segment.trim();
            if let Some(eq_pos) = segment.find('=') {
                let key = segment[..eq_pos].trim().to_ascii_lowercase();
                if key.is_empty() {
                    continue;
                }
                let value = unquote(segment[eq_pos + 1..].trim());
                params.entry(key).or_insert(value);
            }
        }

        HeaderChild { value, params }
    }
}

// Splits on `;` outside of double quotes.
fn split_params(input: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                segments.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&input[start..]);
    segments
}

fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .map(|v| v.strip_suffix('"').unwrap_or(v))
    else {
        return value.trim_matches('\'').to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Decodes an RFC 5987 extended value (`UTF-8'en'na%C3%AFve.png`).
/// Charsets other than UTF-8 are decoded as Latin-1.
pub fn decode_ext_value(value: &str) -> Option<String> {
    let mut pieces = value.splitn(3, '\'');
    let charset = pieces.next()?;
    let _language = pieces.next()?;
    let encoded = pieces.next()?;

    let decoded = percent_decode_str(encoded);
    if charset.eq_ignore_ascii_case("utf-8") {
        Some(decoded.decode_utf8_lossy().into_owned())
    } else {
        Some(decoded.map(char::from).collect())
    }
}
