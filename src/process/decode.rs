//! Decoding of server diagnostic output.
//!
//! PostgreSQL writes its messages in the server locale's encoding, which is
//! frequently not UTF-8 (e.g. GBK on a Chinese Windows install). Validity is
//! judged per line, since a chunk boundary may split a multi-byte sequence.

use encoding_rs::Encoding;

use crate::error::ConfigError;

/// Words the server emits in its zh_CN message catalogue. A line that decodes
/// as UTF-8 and contains one of these is trusted as UTF-8.
pub const DIAGNOSTIC_KEYWORDS: &[&str] = &[
    "语句", "上下文", "位置", "错误", "异常", "失败", "注意", "提示", "SQL状态", "列", "字段",
    "类型", "权限", "拒绝", "角色", "编码", "字符集", "文件", "路径", "函数", "调用",
];

/// Line-oriented decoder with a native-encoding fallback.
#[derive(Debug, Clone, Copy)]
pub struct OutputDecoder {
    fallback: &'static Encoding,
}

impl OutputDecoder {
    /// Creates a decoder that falls back to the encoding named by `label`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownEncoding`] if `label` is not a known
    /// WHATWG encoding label.
    pub fn for_label(label: &str) -> Result<Self, ConfigError> {
        Encoding::for_label(label.as_bytes())
            .map(|fallback| Self { fallback })
            .ok_or_else(|| ConfigError::UnknownEncoding(label.to_string()))
    }

    /// Name of the fallback encoding.
    #[must_use]
    pub fn fallback_name(&self) -> &'static str {
        self.fallback.name()
    }

    /// Decodes a buffer that may hold several lines, rejoining them with
    /// `\n`. A trailing line break does not produce an empty last line.
    #[must_use]
    pub fn decode(&self, data: &[u8]) -> String {
        split_lines(data)
            .map(|line| self.decode_line(line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Decodes one line (without its terminator).
    #[must_use]
    pub fn decode_line(&self, line: &[u8]) -> String {
        match try_utf8(line) {
            Some(text) => text,
            None => self.fallback.decode_without_bom_handling(line).0.into_owned(),
        }
    }
}

/// Returns the UTF-8 reading of `line` if it is trustworthy.
fn try_utf8(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    if DIAGNOSTIC_KEYWORDS.iter().any(|k| text.contains(k)) {
        return Some(text.into_owned());
    }
    if text.contains('\u{FFFD}') || text.as_bytes() != line {
        return None;
    }
    Some(text.into_owned())
}

/// Splits on `\n`, dropping a `\r` that precedes it.
fn split_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let trimmed = data.strip_suffix(b"\n").unwrap_or(data);
    let empty = data.is_empty();
    trimmed
        .split(|b| *b == b'\n')
        .filter(move |_| !empty)
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}
