use std::path::PathBuf;

/// Closed set of publish failure reasons produced by a scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    None,
    NoContent,
    FileMissing,
    SendFailed,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::None => "none",
            Reason::NoContent => "no_content",
            Reason::FileMissing => "file_missing",
            Reason::SendFailed => "send_failed",
        }
    }
}

/// One publishable file under a destination's content tree.
#[derive(Debug, Clone)]
pub struct Asset {
    pub path: PathBuf,
    pub destination: String,
    pub category: String,
    /// First hashtag of the owning category, used as the caption.
    pub hashtag: Option<String>,
}

/// Result of one publish attempt; produced once per tick, never persisted.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub ok: bool,
    pub reason: Reason,
    pub detail: String,
    pub destination: String,
    pub asset: Option<PathBuf>,
}

impl PublishOutcome {
    pub fn success(destination: &str, asset: PathBuf) -> Self {
        Self {
            ok: true,
            reason: Reason::None,
            detail: String::new(),
            destination: destination.to_string(),
            asset: Some(asset),
        }
    }

    pub fn failure(destination: &str, reason: Reason, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason,
            detail: detail.into(),
            destination: destination.to_string(),
            asset: None,
        }
    }
}

/// One raw inbound file waiting to be filed into the content tree.
#[derive(Debug, Clone)]
pub struct Submission {
    pub bytes: Vec<u8>,
    pub suggested_name: String,
    pub caption: Option<String>,
}

/// Aggregated result of flushing one batch of submissions.
#[derive(Debug, Clone, Default)]
pub struct FlushSummary {
    pub saved: usize,
    pub errors: usize,
    pub first_error: Option<String>,
    pub destination: Option<String>,
    pub category: Option<String>,
}
