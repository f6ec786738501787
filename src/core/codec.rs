//! Byte/text conversion for child process streams
//!
//! Output is decoded per read chunk: UTF-8 first (with incomplete trailing
//! sequences carried to the next chunk), then the legacy Japanese encodings
//! and finally lossy UTF-8. Input for pipe-backed children is encoded either
//! as UTF-8 or in the platform's ANSI code page.

use encoding_rs::{Encoding, EUC_JP, ISO_2022_JP, SHIFT_JIS, UTF_8};

/// Longest incomplete UTF-8 sequence that can be carried over
const MAX_CARRY: usize = 3;

/// Legacy encodings tried, in order, when a chunk is not valid UTF-8
fn fallback_chain() -> [&'static Encoding; 3] {
    [SHIFT_JIS, EUC_JP, ISO_2022_JP]
}

/// Stateful decoder for one output stream
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    carry: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one read chunk. Never fails.
    pub fn decode(&mut self, data: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(data);

        match std::str::from_utf8(&bytes) {
            Ok(text) => text.to_string(),
            // Only an incomplete sequence at the very end
            Err(e) if e.error_len().is_none() && bytes.len() - e.valid_up_to() <= MAX_CARRY => {
                let valid = e.valid_up_to();
                self.carry = bytes[valid..].to_vec();
                bytes.truncate(valid);
                String::from_utf8(bytes).unwrap_or_default()
            }
            Err(_) => decode_legacy(&bytes),
        }
    }

    /// Flush carried bytes at end of stream
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.carry);
        if rest.is_empty() {
            String::new()
        } else {
            String::from_utf8_lossy(&rest).into_owned()
        }
    }

    pub fn has_carry(&self) -> bool {
        !self.carry.is_empty()
    }
}

/// Try each legacy encoding strictly, then fall back to lossy UTF-8
fn decode_legacy(bytes: &[u8]) -> String {
    for encoding in fallback_chain() {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            tracing::trace!(encoding = encoding.name(), len = bytes.len(), "decoded legacy chunk");
            return text.into_owned();
        }
    }
    String::from_utf8_lossy(bytes).into_owned()
}

/// Resolve an encoding label such as `shift_jis` or `cp932`
pub fn encoding_for_label(label: &str) -> Option<&'static Encoding> {
    match label.trim().to_ascii_lowercase().as_str() {
        "cp932" | "ms932" | "windows-31j" => Some(SHIFT_JIS),
        other => Encoding::for_label(other.as_bytes()),
    }
}

/// Map a Windows code page number to an encoding
pub fn encoding_for_code_page(code_page: u32) -> Option<&'static Encoding> {
    let label = match code_page {
        932 => "shift_jis",
        936 => "gbk",
        949 => "euc-kr",
        950 => "big5",
        874 => "windows-874",
        1250..=1258 => return Encoding::for_label(format!("windows-{}", code_page).as_bytes()),
        20932 => "euc-jp",
        50220 | 50221 | 50222 => "iso-2022-jp",
        65001 => "utf-8",
        _ => return None,
    };
    Encoding::for_label(label.as_bytes())
}

/// The ANSI code page used for non-UTF-8 pipes.
///
/// Windows asks the system; elsewhere the configured label is used, with
/// Shift_JIS when the label is unknown.
pub fn ansi_encoding(configured: &str) -> &'static Encoding {
    #[cfg(windows)]
    {
        // SAFETY: GetACP has no preconditions
        let code_page = unsafe { windows::Win32::Globalization::GetACP() };
        if let Some(encoding) = encoding_for_code_page(code_page) {
            return encoding;
        }
    }
    encoding_for_label(configured).unwrap_or(SHIFT_JIS)
}

/// Encode text for a pipe-backed child.
///
/// UTF-8 when the pipe is UTF-8 capable. Otherwise `encoding` strictly, and
/// if some characters are unmappable, the same encoding with `?` in their
/// place.
pub fn encode_for_pipe(text: &str, utf8: bool, encoding: &'static Encoding) -> Vec<u8> {
    if utf8 || encoding == UTF_8 {
        return text.as_bytes().to_vec();
    }

    let (bytes, _, had_errors) = encoding.encode(text);
    if !had_errors {
        return bytes.into_owned();
    }

    tracing::debug!(encoding = encoding.name(), "unmappable characters replaced");
    let mut out = Vec::with_capacity(text.len());
    let mut utf8_buf = [0u8; 4];
    for ch in text.chars() {
        let (bytes, _, had_errors) = encoding.encode(ch.encode_utf8(&mut utf8_buf));
        if had_errors {
            out.push(b'?');
        } else {
            out.extend_from_slice(&bytes);
        }
    }
    out
}
