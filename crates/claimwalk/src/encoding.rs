//! Turns response bodies of unknown encoding into clean UTF-8 text.
//!
//! Detection runs an ordered list of [`CharsetDetector`]s over a leading
//! sample of the body. The first guess whose confidence reaches
//! [`ACCEPT_CONFIDENCE`] wins; otherwise the most confident guess is used.
//! The binary sniffer always answers, so detection never comes back empty.

use std::fmt::Display;
use std::sync::LazyLock;

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use regex::bytes::Regex;

pub const SAMPLE_SIZE: usize = 1000;
pub const ACCEPT_CONFIDENCE: f32 = 0.5;
/// Above this many characters the decoded text is written back through its
/// encoding once to make sure the guess holds for the whole body.
pub const VERIFY_THRESHOLD: usize = 5000;
const MAX_REPAIR_PASSES: usize = 8;

static RE_DECLARED_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)charset\s*=\s*["']?([a-z0-9_\-:.]+)"#)
        .expect("invalid regex: declared charset")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Ascii,
    Utf8,
    Legacy(&'static Encoding),
    /// Not text. Carries the sniffed content type.
    Opaque(&'static str),
}

impl Charset {
    pub fn is_textual(&self) -> bool {
        !matches!(self, Charset::Opaque(_))
    }

    fn from_encoding(encoding: &'static Encoding) -> Self {
        if encoding == UTF_8 {
            Charset::Utf8
        } else {
            Charset::Legacy(encoding)
        }
    }
}

impl Display for Charset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Charset::Ascii => write!(f, "us-ascii"),
            Charset::Utf8 => write!(f, "utf-8"),
            Charset::Legacy(encoding) => write!(f, "{}", encoding.name().to_lowercase()),
            Charset::Opaque(content_type) => write!(f, "raw ({})", content_type),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharsetGuess {
    pub charset: Charset,
    pub confidence: f32,
}

impl CharsetGuess {
    fn new(charset: Charset, confidence: f32) -> Self {
        Self {
            charset,
            confidence,
        }
    }
}

pub trait CharsetDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, sample: &[u8]) -> Option<CharsetGuess>;
}

/// Frequency-based detection through chardetng.
#[derive(Debug, Default)]
pub struct StatisticalDetector;

impl CharsetDetector for StatisticalDetector {
    fn name(&self) -> &'static str {
        "statistical"
    }

    fn detect(&self, sample: &[u8]) -> Option<CharsetGuess> {
        if looks_binary(sample) || Encoding::for_bom(sample).is_some() {
            return None;
        }
        if sample.is_ascii() {
            return Some(CharsetGuess::new(Charset::Ascii, 1.0));
        }

        let mut detector = EncodingDetector::new();
        // The sample may stop mid-character, so it is never the last chunk.
        detector.feed(sample, false);
        let encoding = detector.guess(None, true);

        if encoding == UTF_8 {
            return Some(CharsetGuess::new(Charset::Utf8, 0.9));
        }
        let (_, had_errors) = encoding.decode_without_bom_handling(sample);
        let confidence = if had_errors { 0.3 } else { 0.7 };
        Some(CharsetGuess::new(Charset::Legacy(encoding), confidence))
    }
}

/// Byte-order marks, in-document `charset=` declarations, UTF-8 validity,
/// then Windows-1252 as the Western fallback.
#[derive(Debug, Default)]
pub struct HeuristicGuesser;

impl CharsetDetector for HeuristicGuesser {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn detect(&self, sample: &[u8]) -> Option<CharsetGuess> {
        if let Some((encoding, _)) = Encoding::for_bom(sample) {
            return Some(CharsetGuess::new(Charset::from_encoding(encoding), 1.0));
        }
        if looks_binary(sample) {
            return None;
        }

        if let Some(encoding) = RE_DECLARED_CHARSET
            .captures(sample)
            .and_then(|caps| Encoding::for_label(&caps[1]))
        {
            return Some(CharsetGuess::new(Charset::from_encoding(encoding), 0.8));
        }

        if sample.is_ascii() {
            return Some(CharsetGuess::new(Charset::Ascii, 0.6));
        }
        match std::str::from_utf8(sample) {
            Ok(_) => Some(CharsetGuess::new(Charset::Utf8, 0.6)),
            // Only the tail is incomplete.
            Err(e) if e.error_len().is_none() => Some(CharsetGuess::new(Charset::Utf8, 0.6)),
            Err(_) => Some(CharsetGuess::new(Charset::Legacy(WINDOWS_1252), 0.4)),
        }
    }
}

/// Last resort: magic numbers. Always answers.
#[derive(Debug, Default)]
pub struct BinarySniffer;

impl CharsetDetector for BinarySniffer {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn detect(&self, sample: &[u8]) -> Option<CharsetGuess> {
        Some(CharsetGuess::new(
            Charset::Opaque(sniff_content_type(sample)),
            0.1,
        ))
    }
}

pub fn sniff_content_type(sample: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF", "application/pdf"),
        (b"\x89PNG", "image/png"),
        (b"\xFF\xD8\xFF", "image/jpeg"),
        (b"GIF8", "image/gif"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1F\x8B", "application/gzip"),
    ];
    SIGNATURES
        .iter()
        .find(|(magic, _)| sample.starts_with(magic))
        .map(|(_, content_type)| *content_type)
        .unwrap_or("application/octet-stream")
}

fn looks_binary(sample: &[u8]) -> bool {
    if sample.contains(&0) {
        return true;
    }
    let controls = sample
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\n' | b'\r' | b'\t' | 0x0C | 0x1B))
        .count();
    controls * 4 > sample.len()
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedText {
    pub text: String,
    pub encoding: Charset,
    /// Size of the input before any truncation.
    pub byte_length: usize,
    pub was_truncated: bool,
    /// The untouched input when it could not be treated as text.
    pub opaque: Option<Vec<u8>>,
}

impl NormalizedText {
    fn empty(byte_length: usize) -> Self {
        Self {
            text: String::new(),
            encoding: Charset::Utf8,
            byte_length,
            was_truncated: false,
            opaque: None,
        }
    }

    fn opaque(bytes: &[u8], content_type: &'static str) -> Self {
        Self {
            text: String::new(),
            encoding: Charset::Opaque(content_type),
            byte_length: bytes.len(),
            was_truncated: false,
            opaque: Some(bytes.to_vec()),
        }
    }

    pub fn is_opaque(&self) -> bool {
        !self.encoding.is_textual()
    }
}

pub struct Normalizer {
    detectors: Vec<Box<dyn CharsetDetector>>,
    max_bytes: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Normalizer")
            .field(
                "detectors",
                &self.detectors.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl Normalizer {
    pub fn new(max_bytes: usize) -> Self {
        Self::with_detectors(
            vec![
                Box::new(StatisticalDetector),
                Box::new(HeuristicGuesser),
                Box::new(BinarySniffer),
            ],
            max_bytes,
        )
    }

    pub fn with_detectors(detectors: Vec<Box<dyn CharsetDetector>>, max_bytes: usize) -> Self {
        Self {
            detectors,
            max_bytes,
        }
    }

    pub fn detect(&self, sample: &[u8]) -> CharsetGuess {
        let mut best: Option<CharsetGuess> = None;
        for detector in &self.detectors {
            let Some(guess) = detector.detect(sample) else {
                log::trace!("Detector {} had no opinion", detector.name());
                continue;
            };
            log::trace!(
                "Detector {} guessed {} ({:.2})",
                detector.name(),
                guess.charset,
                guess.confidence
            );
            if guess.confidence >= ACCEPT_CONFIDENCE {
                return guess;
            }
            if best.is_none_or(|b| guess.confidence > b.confidence) {
                best = Some(guess);
            }
        }
        best.unwrap_or_else(|| {
            CharsetGuess::new(Charset::Opaque(sniff_content_type(sample)), 0.0)
        })
    }

    pub fn normalize(&self, bytes: &[u8]) -> NormalizedText {
        if bytes.first().is_none_or(|&b| b == 0) {
            return NormalizedText::empty(bytes.len());
        }

        let sample = &bytes[..bytes.len().min(SAMPLE_SIZE)];
        let mut charset = self.detect(sample).charset;

        // The sample can miss multibyte text further down the body.
        if charset == Charset::Ascii && has_multibyte_text(bytes) {
            log::debug!("ASCII guess contradicted by the full body, using UTF-8");
            charset = Charset::Utf8;
        }

        let (Charset::Ascii | Charset::Utf8 | Charset::Legacy(_)) = charset else {
            log::debug!("Treating {} byte body as {}", bytes.len(), charset);
            return NormalizedText::opaque(bytes, sniff_content_type(sample));
        };

        let plain = bytes.iter().all(|&b| is_plain_ascii(b));
        let decoded = match charset {
            Charset::Legacy(encoding) if !plain => encoding.decode(bytes).0.into_owned(),
            _ => String::from_utf8_lossy(bytes).into_owned(),
        };

        // Checked before repair: repaired text may hold characters the page's
        // own encoding never could.
        if decoded.chars().count() > VERIFY_THRESHOLD && !writes_through(&decoded, charset) {
            log::debug!("Text does not round-trip through {}, keeping raw bytes", charset);
            return NormalizedText::opaque(bytes, sniff_content_type(sample));
        }

        let mut text = if plain {
            strip_control(&decoded)
        } else {
            clean_text(&decoded)
        };
        let mut was_truncated = false;
        if text.len() > self.max_bytes {
            let mut end = self.max_bytes;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
            was_truncated = true;
            log::debug!(
                "Normalized text truncated from {} to {} bytes",
                bytes.len(),
                end
            );
        }

        NormalizedText {
            text,
            encoding: charset,
            byte_length: bytes.len(),
            was_truncated,
            opaque: None,
        }
    }
}

fn is_plain_ascii(b: u8) -> bool {
    matches!(b, 0x20..=0x7E | b'\n' | b'\r' | b'\t')
}

fn has_multibyte_text(bytes: &[u8]) -> bool {
    String::from_utf8_lossy(bytes).chars().count() != bytes.len() || !bytes.is_ascii()
}

fn writes_through(text: &str, charset: Charset) -> bool {
    match charset {
        Charset::Ascii => text.is_ascii(),
        Charset::Utf8 => true,
        Charset::Legacy(encoding) => !encoding.encode(text).2,
        Charset::Opaque(_) => false,
    }
}

/// Repairs mojibake until the text settles, then strips control characters.
/// Misread text carries C1 controls inside its runs, so stripping waits for
/// the repair. Cleaning already clean text changes nothing.
pub fn clean_text(text: &str) -> String {
    let mut current = text.to_string();
    for _ in 0..MAX_REPAIR_PASSES {
        let repaired = repair_mojibake(&current);
        if repaired != current {
            current = repaired;
            continue;
        }
        let stripped = strip_control(&current);
        if stripped == current {
            return current;
        }
        current = stripped;
    }
    strip_control(&current)
}

/// Drops control characters, keeping newlines. Tabs become spaces.
pub fn strip_control(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '\n' => Some('\n'),
            '\t' => Some(' '),
            '\u{FEFF}' => None,
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect()
}

const CP1252_HIGH: [(char, u8); 27] = [
    ('\u{20AC}', 0x80),
    ('\u{201A}', 0x82),
    ('\u{0192}', 0x83),
    ('\u{201E}', 0x84),
    ('\u{2026}', 0x85),
    ('\u{2020}', 0x86),
    ('\u{2021}', 0x87),
    ('\u{02C6}', 0x88),
    ('\u{2030}', 0x89),
    ('\u{0160}', 0x8A),
    ('\u{2039}', 0x8B),
    ('\u{0152}', 0x8C),
    ('\u{017D}', 0x8E),
    ('\u{2018}', 0x91),
    ('\u{2019}', 0x92),
    ('\u{201C}', 0x93),
    ('\u{201D}', 0x94),
    ('\u{2022}', 0x95),
    ('\u{2013}', 0x96),
    ('\u{2014}', 0x97),
    ('\u{02DC}', 0x98),
    ('\u{2122}', 0x99),
    ('\u{0161}', 0x9A),
    ('\u{203A}', 0x9B),
    ('\u{0153}', 0x9C),
    ('\u{017E}', 0x9E),
    ('\u{0178}', 0x9F),
];

/// The byte a character came from if UTF-8 was misread as Latin-1 or
/// Windows-1252.
fn western_byte(ch: char) -> Option<u8> {
    let cp = ch as u32;
    if (0x80..=0xFF).contains(&cp) {
        return Some(cp as u8);
    }
    CP1252_HIGH
        .iter()
        .find(|(c, _)| *c == ch)
        .map(|(_, b)| *b)
}

/// One repair pass: every run of Western high characters is turned back into
/// bytes, and whatever part of those bytes forms valid UTF-8 replaces the run.
pub fn repair_mojibake(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut bytes = Vec::new();
    let mut chars = Vec::new();

    for ch in text.chars() {
        match western_byte(ch) {
            Some(b) => {
                bytes.push(b);
                chars.push(ch);
            }
            None => {
                flush_run(&mut bytes, &mut chars, &mut out);
                out.push(ch);
            }
        }
    }
    flush_run(&mut bytes, &mut chars, &mut out);
    out
}

fn flush_run(bytes: &mut Vec<u8>, chars: &mut Vec<char>, out: &mut String) {
    let mut pos = 0;
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
        pos += chunk.valid().len();
        let invalid = chunk.invalid().len();
        out.extend(&chars[pos..pos + invalid]);
        pos += invalid;
    }
    bytes.clear();
    chars.clear();
}
