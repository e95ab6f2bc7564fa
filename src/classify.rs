//! Maps a publish outcome onto fixed human-readable text plus, for transport
//! rejections, an operator hint matched from the error text.
use crate::model::{PublishOutcome, Reason};

/// Human-readable breakdown of a failed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub reason_text: &'static str,
    pub hint: Option<&'static str>,
}

/// Ordered hint table for `send_failed` error text. Patterns are matched as
/// case-insensitive substrings; the first matching row wins.
const HINT_TABLE: &[(&[&str], &str)] = &[
    (
        &["chat not found"],
        "bot is not in the channel or the chat id is wrong",
    ),
    (
        &["kicked", "not a member"],
        "bot was removed from the channel; add it back as an administrator",
    ),
    (
        &["forbidden"],
        "bot lacks permission to post; check its rights in the channel",
    ),
    (
        &["wrong file identifier", "invalid"],
        "file is corrupt or in an unsupported format",
    ),
    (
        &["too large", "file is too big"],
        "file exceeds the transport size limit",
    ),
    (
        &["flood", "too many requests"],
        "rate limit hit; the transport is throttling the bot",
    ),
];

/// Pure classification of one outcome.
pub fn classify(outcome: &PublishOutcome) -> Diagnosis {
    let reason_text = match outcome.reason {
        Reason::None => "ok",
        Reason::NoContent => "no matching files",
        Reason::FileMissing => "asset vanished from storage",
        Reason::SendFailed => "transport rejected the delivery",
    };
    let hint = if outcome.reason == Reason::SendFailed {
        match_hint(&outcome.detail)
    } else {
        None
    };
    Diagnosis { reason_text, hint }
}

fn match_hint(detail: &str) -> Option<&'static str> {
    let lower = detail.to_lowercase();
    for (patterns, hint) in HINT_TABLE {
        if patterns.iter().any(|p| lower.contains(p)) {
            return Some(hint);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_failed(detail: &str) -> PublishOutcome {
        PublishOutcome::failure("ch", Reason::SendFailed, detail)
    }

    #[test]
    fn reason_texts() {
        let d = classify(&PublishOutcome::failure("ch", Reason::NoContent, ""));
        assert_eq!(d.reason_text, "no matching files");
        assert_eq!(d.hint, None);

        let d = classify(&PublishOutcome::failure("ch", Reason::FileMissing, ""));
        assert_eq!(d.reason_text, "asset vanished from storage");
        assert_eq!(d.hint, None);
    }

    #[test]
    fn hint_matching_is_case_insensitive() {
        let d = classify(&send_failed("Bad Request: CHAT NOT FOUND"));
        assert!(d.hint.unwrap().contains("chat id"));
    }

    #[test]
    fn first_match_wins() {
        // "invalid" appears in a later row than "kicked"; the earlier row wins.
        let d = classify(&send_failed("bot was kicked; invalid state"));
        assert!(d.hint.unwrap().contains("removed from the channel"));
    }

    #[test]
    fn every_table_row_is_reachable() {
        for probe in [
            "chat not found",
            "not a member",
            "Forbidden: something",
            "wrong file identifier",
            "Request Entity Too Large",
            "Too Many Requests: retry later",
        ] {
            assert!(classify(&send_failed(probe)).hint.is_some(), "{probe}");
        }
    }

    #[test]
    fn unknown_error_has_no_hint() {
        let d = classify(&send_failed("socket hangup"));
        assert_eq!(d.hint, None);
    }

    #[test]
    fn hint_only_for_send_failed() {
        let d = classify(&PublishOutcome::failure(
            "ch",
            Reason::FileMissing,
            "chat not found", // would match if the reason were send_failed
        ));
        assert_eq!(d.hint, None);
    }
}
