use serde::{Deserialize, Serialize};

/// 待翻译的一行字幕
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtitleLine {
    pub index: u32,
    pub text: String,
}

impl SubtitleLine {
    pub fn new(index: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }
}

/// 翻译结果中的一行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TranslatedLine {
    pub index: u32,
    pub original: String,
    pub translated: String,
    /// 失败行的错误类型，例如 `MISSING_LINE`、`MAX_RETRIES_EXCEEDED`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl TranslatedLine {
    pub fn success(index: u32, original: impl Into<String>, translated: impl Into<String>) -> Self {
        Self {
            index,
            original: original.into(),
            translated: translated.into(),
            error_type: None,
        }
    }

    pub fn failed(line: &SubtitleLine, error_type: impl Into<String>) -> Self {
        Self {
            index: line.index,
            original: line.text.clone(),
            translated: String::new(),
            error_type: Some(error_type.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_type.is_none()
    }
}

/// 行级错误类型
pub mod line_errors {
    pub const MISSING_LINE: &str = "MISSING_LINE";
    pub const MAX_RETRIES_EXCEEDED: &str = "MAX_RETRIES_EXCEEDED";
    pub const CANCELLED: &str = "CANCELLED";
}
