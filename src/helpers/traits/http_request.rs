use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use http::header::{HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use http::HeaderMap;
use tracing::debug;

use crate::error::{MultipartError, NoSeparator};
use crate::helpers::traits::{bytes::SplitBytes, decode_ext_value, GetHeaderChild, HeaderChild};
use crate::RawRequest;

/// Extension used when the uploaded filename carries none.
pub const DEFAULT_EXTENSION: &str = "jpg";

const CONTENT_TRANSFER_ENCODING: HeaderName = HeaderName::from_static("content-transfer-encoding");

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// The file pulled out of a multipart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub payload: Vec<u8>,
    pub extension: String,
    pub filename: Option<String>,
}

/// Outcome of one extraction attempt. Only `Found` carries a file; the other
/// variants are absence conditions the connection loop logs and moves past.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(ExtractedFile),
    NoSeparator,
    NotMultipart,
    NoFilenamePart,
    Malformed(MultipartError),
}

impl Extraction {
    pub fn into_file(self) -> Option<ExtractedFile> {
        match self {
            Extraction::Found(file) => Some(file),
            _ => None,
        }
    }

    pub fn file(&self) -> Option<&ExtractedFile> {
        match self {
            Extraction::Found(file) => Some(file),
            _ => None,
        }
    }
}

pub trait RequestUtils {
    fn split(&self) -> Result<(&[u8], &[u8]), NoSeparator>;
    fn get_multi_part(&self) -> Result<Option<Multipart<'_>>, MultipartError>;
    fn extract_file(&self) -> Extraction;
}

impl RequestUtils for RawRequest {
    fn split(&self) -> Result<(&[u8], &[u8]), NoSeparator> {
        self.bytes.split_header_body()
    }

    /// Parses the whole buffer as a message. `Ok(None)` when the message is
    /// not multipart.
    fn get_multi_part(&self) -> Result<Option<Multipart<'_>>, MultipartError> {
        Multipart::parse(&self.bytes)
    }

    fn extract_file(&self) -> Extraction {
        if self.split().is_err() {
            return Extraction::NoSeparator;
        }

        let multipart = match self.get_multi_part() {
            Ok(Some(multipart)) => multipart,
            Ok(None) => return Extraction::NotMultipart,
            Err(e) => return Extraction::Malformed(e),
        };

        multipart
            .parts()
            .find_map(|part| match part {
                Ok(part) if part.has_filename() => Some(Ok(part)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .map_or(Extraction::NoFilenamePart, |found| match found {
                Ok(part) => Extraction::Found(part.to_extracted_file()),
                Err(e) => Extraction::Malformed(e),
            })
    }
}

/// A multipart message borrowed from a raw request.
#[derive(Debug)]
pub struct Multipart<'a> {
    pub headers: HeaderMap,
    pub boundary: String,
    pub body: &'a [u8],
}

impl<'a> Multipart<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Option<Self>, MultipartError> {
        let (header_block, body) = match raw.find_blank_line() {
            Some((header_end, body_start)) => (&raw[..header_end], &raw[body_start..]),
            None => (raw, &raw[raw.len()..]),
        };
        let headers = parse_header_block(header_block, true);

        let Some(content_type) = header_child(&headers, &CONTENT_TYPE) else {
            return Ok(None);
        };
        if !content_type.value.starts_with("multipart/") {
            return Ok(None);
        }

        match content_type.get("boundary") {
            Some(boundary) if !boundary.is_empty() => Ok(Some(Multipart {
                boundary: boundary.to_string(),
                headers,
                body,
            })),
            _ => Err(MultipartError::MissingBoundary),
        }
    }

    /// Parts in buffer order. Yields an error and stops when the structure
    /// breaks down.
    pub fn parts(&self) -> Parts<'a> {
        let mut dash_boundary = Vec::with_capacity(self.boundary.len() + 2);
        dash_boundary.extend_from_slice(b"--");
        dash_boundary.extend_from_slice(self.boundary.as_bytes());

        Parts {
            body: self.body,
            dash_boundary,
            cursor: None,
            index: 0,
            finished: false,
        }
    }
}

#[derive(Debug)]
pub struct MultipartPart<'a> {
    pub index: usize,
    pub headers: HeaderMap,
    pub body: &'a [u8],
}

impl MultipartPart<'_> {
    pub fn disposition(&self) -> Option<HeaderChild> {
        header_child(&self.headers, &CONTENT_DISPOSITION)
    }

    pub fn has_filename(&self) -> bool {
        self.disposition()
            .is_some_and(|d| d.contains("filename") || d.contains("filename*"))
    }

    /// `filename*` wins over `filename`; a Content-Type `name` parameter is
    /// the last resort.
    pub fn filename(&self) -> Option<String> {
        let from_disposition = self.disposition().and_then(|d| {
            d.get("filename*")
                .and_then(decode_ext_value)
                .or_else(|| d.get("filename").map(str::to_string))
        });

        from_disposition.or_else(|| {
            header_child(&self.headers, &CONTENT_TYPE)
                .and_then(|ct| ct.get("name").map(str::to_string))
        })
    }

    /// Payload with any Content-Transfer-Encoding reversed.
    pub fn decoded_payload(&self) -> Vec<u8> {
        let encoding = self
            .headers
            .get(&CONTENT_TRANSFER_ENCODING)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_ascii_lowercase());

        match encoding.as_deref() {
            Some("base64") => decode_base64(self.body),
            Some("quoted-printable") => decode_quoted_printable(self.body),
            _ => self.body.to_vec(),
        }
    }

    pub fn to_extracted_file(&self) -> ExtractedFile {
        let filename = self.filename();
        ExtractedFile {
            payload: self.decoded_payload(),
            extension: extension_of(filename.as_deref()),
            filename,
        }
    }
}

/// The substring after the last `.` (possibly empty), or
/// [`DEFAULT_EXTENSION`] when there is no period or no filename.
pub fn extension_of(filename: Option<&str>) -> String {
    filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.contains(['/', '\\']))
        .unwrap_or(DEFAULT_EXTENSION)
        .to_string()
}

pub struct Parts<'a> {
    body: &'a [u8],
    dash_boundary: Vec<u8>,
    cursor: Option<usize>,
    index: usize,
    finished: bool,
}

struct Delimiter {
    // Where the preceding part's content ends (before the line break).
    content_end: usize,
    // First byte after the delimiter line.
    next_start: usize,
    closing: bool,
}

impl<'a> Parts<'a> {
    fn next_delimiter(&self, from: usize) -> Option<Delimiter> {
        let body = self.body;
        let mut search = from;

        while search < body.len() {
            let pos = search + body[search..].find_bytes(&self.dash_boundary)?;
            search = pos + 1;

            if pos > 0 && body[pos - 1] != b'\n' {
                continue;
            }

            let mut after = pos + self.dash_boundary.len();
            let closing = body[after..].starts_with(b"--");
            if closing {
                after += 2;
            }
            while after < body.len() && matches!(body[after], b' ' | b'\t') {
                after += 1;
            }

            let rest = &body[after..];
            let next_start = if rest.is_empty() {
                after
            } else if rest.starts_with(b"\r\n") {
                after + 2
            } else if rest.starts_with(b"\n") || rest.starts_with(b"\r") {
                after + 1
            } else {
                continue;
            };

            let content_end = match pos {
                0 => 0,
                p if p >= 2 && body[p - 2] == b'\r' => p - 2,
                p => p - 1,
            };

            return Some(Delimiter {
                content_end,
                next_start,
                closing,
            });
        }
        None
    }

    fn fail(&mut self, error: MultipartError) -> Option<Result<MultipartPart<'a>, MultipartError>> {
        self.finished = true;
        Some(Err(error))
    }
}

impl<'a> Iterator for Parts<'a> {
    type Item = Result<MultipartPart<'a>, MultipartError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let start = match self.cursor {
            Some(cursor) => cursor,
            None => match self.next_delimiter(0) {
                Some(first) if first.closing => {
                    self.finished = true;
                    return None;
                }
                Some(first) => first.next_start,
                None => return self.fail(MultipartError::StartBoundaryNotFound),
            },
        };

        let index = self.index;
        let Some(delimiter) = self.next_delimiter(start) else {
            return self.fail(MultipartError::TruncatedPart { index });
        };

        let content = &self.body[start..delimiter.content_end.max(start)];
        self.cursor = Some(delimiter.next_start);
        self.index += 1;
        if delimiter.closing {
            self.finished = true;
        }

        Some(Ok(parse_part(content, index)))
    }
}

/// Headers up to the first blank line, payload after it. A part with no
/// blank line is all headers with an empty payload.
fn parse_part(content: &[u8], index: usize) -> MultipartPart<'_> {
    if let Some(body) = content
        .strip_prefix(b"\r\n")
        .or_else(|| content.strip_prefix(b"\n"))
    {
        return MultipartPart {
            index,
            headers: HeaderMap::new(),
            body,
        };
    }

    let (header_end, body_start) = content
        .find_blank_line()
        .unwrap_or((content.len(), content.len()));

    MultipartPart {
        index,
        headers: parse_header_block(&content[..header_end], false),
        body: &content[body_start..],
    }
}

fn header_child(headers: &HeaderMap, name: &HeaderName) -> Option<HeaderChild> {
    let value = headers.get(name)?;
    let value = String::from_utf8_lossy(value.as_bytes());
    let value: &str = &value;
    Some(value.get_header_child())
}

/// Parses `Name: value` lines, joining folded continuation lines. With
/// `skip_start_line`, a first line that is not a header (a request line) is
/// ignored.
fn parse_header_block(block: &[u8], skip_start_line: bool) -> HeaderMap {
    let mut fields: Vec<(&[u8], Vec<u8>)> = Vec::new();

    for (i, line) in block.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        if matches!(line[0], b' ' | b'\t') {
            if let Some((_, value)) = fields.last_mut() {
                value.push(b' ');
                value.extend_from_slice(line.trim_ascii());
            }
            continue;
        }

        match split_header_line(line) {
            Some((name, value)) => fields.push((name, value.to_vec())),
            None if i == 0 && skip_start_line => debug!(
                line = %String::from_utf8_lossy(line),
                "skipping start line"
            ),
            None => debug!(
                line = %String::from_utf8_lossy(line),
                "ignoring malformed header line"
            ),
        }
    }

    let mut headers = HeaderMap::new();
    for (name, value) in fields {
        match (
            HeaderName::from_bytes(name),
            HeaderValue::from_bytes(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(
                name = %String::from_utf8_lossy(name),
                "dropping header with invalid name or value"
            ),
        }
    }
    headers
}

fn split_header_line(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = &line[..colon];
    if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
        return None;
    }
    Some((name, line[colon + 1..].trim_ascii()))
}

fn decode_base64(body: &[u8]) -> Vec<u8> {
    let cleaned: Vec<u8> = body
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    match LENIENT_BASE64.decode(&cleaned) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(error = %e, "invalid base64 payload, keeping raw bytes");
            body.to_vec()
        }
    }
}

fn decode_quoted_printable(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;

    while i < body.len() {
        if body[i] != b'=' {
            out.push(body[i]);
            i += 1;
            continue;
        }

        let rest = &body[i + 1..];
        if rest.starts_with(b"\r\n") {
            i += 3;
        } else if rest.starts_with(b"\n") {
            i += 2;
        } else if let (Some(hi), Some(lo)) = (
            rest.first().and_then(|&b| hex_value(b)),
            rest.get(1).and_then(|&b| hex_value(b)),
        ) {
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(b'=');
            i += 1;
        }
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReadEnd;

    fn request(bytes: &[u8]) -> RawRequest {
        RawRequest::new(bytes.to_vec(), ReadEnd::PeerClosed)
    }

    fn upload(boundary: &str, parts: &[&str]) -> Vec<u8> {
        let parts: Vec<&[u8]> = parts.iter().map(|p| p.as_bytes()).collect();
        upload_bytes(boundary, &parts)
    }

    fn upload_bytes(boundary: &str, parts: &[&[u8]]) -> Vec<u8> {
        let mut raw = format!(
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Type: multipart/form-data; boundary={boundary}\r\n\r\n"
        )
        .into_bytes();
        for part in parts {
            raw.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            raw.extend_from_slice(part);
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        raw
    }

    #[test]
    fn extracts_single_file_part() {
        let payload = b"\x89PNG\r\n\x1a\n\x00\x00binary\r\n--almost";
        let mut part = b"Content-Disposition: form-data; name=\"file\"; filename=\"pic.png\"\r\nContent-Type: image/png\r\n\r\n".to_vec();
        part.extend_from_slice(payload);
        let raw = upload_bytes("XYZ", &[part.as_slice()]);

        let file = request(&raw).extract_file().into_file().unwrap();
        assert_eq!(file.payload, payload);
        assert_eq!(file.extension, "png");
        assert_eq!(file.filename.as_deref(), Some("pic.png"));
    }

    #[test]
    fn first_filename_part_wins() {
        let raw = upload(
            "XYZ",
            &[
                "Content-Disposition: form-data; name=\"note\"\r\n\r\nhello",
                "Content-Disposition: form-data; name=\"a\"; filename=\"first.gif\"\r\n\r\nAAA",
                "Content-Disposition: form-data; name=\"b\"; filename=\"second.png\"\r\n\r\nBBB",
            ],
        );

        let file = request(&raw).extract_file().into_file().unwrap();
        assert_eq!(file.payload, b"AAA");
        assert_eq!(file.extension, "gif");

        let swapped = upload(
            "XYZ",
            &[
                "Content-Disposition: form-data; name=\"b\"; filename=\"second.png\"\r\n\r\nBBB",
                "Content-Disposition: form-data; name=\"a\"; filename=\"first.gif\"\r\n\r\nAAA",
            ],
        );
        let file = request(&swapped).extract_file().into_file().unwrap();
        assert_eq!(file.payload, b"BBB");
        assert_eq!(file.extension, "png");
    }

    #[test]
    fn extension_uses_last_period_or_default() {
        assert_eq!(extension_of(Some("archive.tar.gz")), "gz");
        assert_eq!(extension_of(Some("README")), DEFAULT_EXTENSION);
        assert_eq!(extension_of(Some("trailing.")), "");
        assert_eq!(extension_of(Some("dir.v2/photo")), DEFAULT_EXTENSION);
        assert_eq!(extension_of(None), DEFAULT_EXTENSION);
    }

    #[test]
    fn empty_filename_defaults_extension() {
        let raw = upload(
            "b",
            &["Content-Disposition: form-data; name=\"f\"; filename=\"\"\r\n\r\ndata"],
        );
        let file = request(&raw).extract_file().into_file().unwrap();
        assert_eq!(file.extension, "jpg");
        assert_eq!(file.payload, b"data");
    }

    #[test]
    fn trailing_period_gives_empty_extension() {
        let raw = upload(
            "XYZ",
            &["Content-Disposition: form-data; name=\"file\"; filename=\"pic.\"\r\n\r\ndata"],
        );
        let file = request(&raw).extract_file().into_file().unwrap();
        assert_eq!(file.extension, "");
        assert_eq!(file.payload, b"data");
    }

    #[test]
    fn headers_only_part_does_not_stop_the_scan() {
        let raw = upload(
            "XYZ",
            &[
                "Content-Disposition: form-data; name=\"note\"",
                "Content-Disposition: form-data; name=\"file\"; filename=\"a.png\"\r\n\r\nPNGDATA",
            ],
        );
        let req = request(&raw);

        let multipart = req.get_multi_part().unwrap().unwrap();
        let first = multipart.parts().next().unwrap().unwrap();
        assert!(first.body.is_empty());
        assert!(!first.has_filename());
        assert!(first.disposition().is_some());

        let file = req.extract_file().into_file().unwrap();
        assert_eq!(file.payload, b"PNGDATA");
        assert_eq!(file.extension, "png");
    }

    #[test]
    fn extended_filename_is_preferred() {
        let raw = upload(
            "b",
            &["Content-Disposition: form-data; name=\"f\"; filename=\"fallback.bin\"; filename*=UTF-8''caf%C3%A9.webp\r\n\r\nx"],
        );
        let file = request(&raw).extract_file().into_file().unwrap();
        assert_eq!(file.filename.as_deref(), Some("caf\u{e9}.webp"));
        assert_eq!(file.extension, "webp");
    }

    #[test]
    fn reverses_transfer_encodings() {
        let raw = upload(
            "b",
            &["Content-Disposition: attachment; filename=\"a.txt\"\r\nContent-Transfer-Encoding: base64\r\n\r\naGVs\r\nbG8="],
        );
        let file = request(&raw).extract_file().into_file().unwrap();
        assert_eq!(file.payload, b"hello");

        let raw = upload(
            "b",
            &["Content-Disposition: attachment; filename=\"a.txt\"\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\ncaf=C3=A9 =\r\nsoft"],
        );
        let file = request(&raw).extract_file().into_file().unwrap();
        assert_eq!(file.payload, "caf\u{e9} soft".as_bytes());
    }

    #[test]
    fn invalid_base64_keeps_raw_payload() {
        let raw = upload(
            "b",
            &["Content-Disposition: attachment; filename=\"a.txt\"\r\nContent-Transfer-Encoding: base64\r\n\r\n!!not base64!!"],
        );
        let file = request(&raw).extract_file().into_file().unwrap();
        assert_eq!(file.payload, b"!!not base64!!");
    }

    #[test]
    fn no_separator_skips_extraction() {
        let raw = b"POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=XYZ\r\n";
        assert_eq!(request(raw).extract_file(), Extraction::NoSeparator);
        assert_eq!(request(b"").extract_file(), Extraction::NoSeparator);
    }

    #[test]
    fn plain_request_is_not_multipart() {
        assert_eq!(
            request(b"GET / HTTP/1.1\r\n\r\n").extract_file(),
            Extraction::NotMultipart
        );
        assert_eq!(
            request(b"POST / HTTP/1.1\r\nContent-Type: application/json\r\n\r\n{}").extract_file(),
            Extraction::NotMultipart
        );
    }

    #[test]
    fn form_without_files_yields_nothing() {
        let raw = upload(
            "XYZ",
            &[
                "Content-Disposition: form-data; name=\"filename\"\r\n\r\nnot a file",
                "Content-Disposition: form-data; name=\"other\"\r\n\r\nvalue",
            ],
        );
        assert_eq!(request(&raw).extract_file(), Extraction::NoFilenamePart);
    }

    #[test]
    fn missing_boundary_is_malformed() {
        let raw = b"POST / HTTP/1.1\r\nContent-Type: multipart/form-data\r\n\r\n--XYZ\r\n";
        assert_eq!(
            request(raw).extract_file(),
            Extraction::Malformed(MultipartError::MissingBoundary)
        );
    }

    #[test]
    fn body_without_delimiters_is_malformed() {
        let raw = b"POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=XYZ\r\n\r\njust text";
        assert_eq!(
            request(raw).extract_file(),
            Extraction::Malformed(MultipartError::StartBoundaryNotFound)
        );
    }

    #[test]
    fn truncated_file_part_is_malformed() {
        let raw = b"POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=XYZ\r\n\r\n--XYZ\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.png\"\r\n\r\nhalf of the";
        assert_eq!(
            request(raw).extract_file(),
            Extraction::Malformed(MultipartError::TruncatedPart { index: 0 })
        );
    }

    #[test]
    fn complete_file_part_survives_later_truncation() {
        let raw = b"POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=XYZ\r\n\r\n--XYZ\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.png\"\r\n\r\nfull\r\n--XYZ\r\nContent-Disposition: form-data; name=\"g\"; filename=\"b.png\"\r\n\r\nhal";
        let file = request(raw).extract_file().into_file().unwrap();
        assert_eq!(file.payload, b"full");
    }

    #[test]
    fn quoted_boundary_and_folded_header() {
        let raw = b"POST / HTTP/1.1\r\nContent-Type: multipart/form-data;\r\n boundary=\"a b\"\r\n\r\npreamble\r\n--a b\r\nContent-Disposition: form-data; name=\"f\";\r\n\tfilename=\"x.jpeg\"\r\n\r\nJPEG\r\n--a b--\r\nepilogue";
        let file = request(raw).extract_file().into_file().unwrap();
        assert_eq!(file.payload, b"JPEG");
        assert_eq!(file.extension, "jpeg");
    }

    #[test]
    fn boundary_text_inside_payload_is_not_a_delimiter() {
        let raw = upload(
            "XYZ",
            &["Content-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\r\nsee --XYZ here\r\n--XYZextra"],
        );
        let file = request(&raw).extract_file().into_file().unwrap();
        assert_eq!(file.payload, b"see --XYZ here\r\n--XYZextra");
    }

    #[test]
    fn empty_payload_is_still_a_file() {
        let raw = upload(
            "XYZ",
            &["Content-Disposition: form-data; name=\"f\"; filename=\"empty.png\"\r\n\r\n"],
        );
        let file = request(&raw).extract_file().into_file().unwrap();
        assert!(file.payload.is_empty());
        assert_eq!(file.extension, "png");
    }

    #[test]
    fn lf_only_message_is_parsed_after_crlf_split() {
        let raw = b"Content-Type: multipart/mixed; boundary=q\r\n\r\n--q\nContent-Disposition: attachment; filename=\"n.md\"\n\n# hi\n--q--\n";
        let file = request(raw).extract_file().into_file().unwrap();
        assert_eq!(file.payload, b"# hi");
        assert_eq!(file.extension, "md");
    }

    #[test]
    fn parts_iterate_in_buffer_order() {
        let raw = upload("XYZ", &["\r\none", "\r\ntwo", "\r\nthree"]);
        let req = request(&raw);
        let multipart = req.get_multi_part().unwrap().unwrap();
        let bodies: Vec<Vec<u8>> = multipart
            .parts()
            .map(|p| p.unwrap().body.to_vec())
            .collect();
        assert_eq!(bodies, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }
}
