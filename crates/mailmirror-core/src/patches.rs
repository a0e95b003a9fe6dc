use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::{MessageTree, StoredMessage};

static BRACKET_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[([^\]]*)\]").expect("valid bracket regex"));
static SERIES_POSITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)/(\d+)$").expect("valid series regex"));

/// How a subject line places a message within a patch series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PatchKind {
    NotPatch,
    /// `[PATCH]`, `[PATCH v2]`, `[RFC PATCH]`, ...
    Singleton,
    /// `[PATCH 0/N]`
    CoverLetter { total: u32 },
    /// `[PATCH M/N]` with `0 < M <= N`
    Numbered { index: u32, total: u32 },
}

/// Classifies a subject by its leading bracketed tags. Only tags at the very
/// start count, so replies (`Re: [PATCH ...]`) are not patches. Mailing-list
/// tags such as `[xen-devel]` before the patch tag are skipped.
pub fn classify_subject(subject: &str) -> PatchKind {
    let mut rest = subject;
    while let Some(caps) = BRACKET_TAG.captures(rest) {
        let tag = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if let Some(kind) = classify_tag(tag) {
            return kind;
        }
        rest = &rest[caps.get(0).map(|m| m.end()).unwrap_or(rest.len())..];
    }
    PatchKind::NotPatch
}

fn classify_tag(tag: &str) -> Option<PatchKind> {
    let words: Vec<&str> = tag.split_whitespace().collect();
    if !words.iter().any(|w| w.eq_ignore_ascii_case("PATCH")) {
        return None;
    }
    for word in &words {
        let Some(caps) = SERIES_POSITION.captures(word) else {
            continue;
        };
        let (Ok(index), Ok(total)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
            return Some(PatchKind::NotPatch);
        };
        return Some(match index {
            0 => PatchKind::CoverLetter { total },
            m if m <= total => PatchKind::Numbered { index, total },
            _ => PatchKind::NotPatch,
        });
    }
    Some(PatchKind::Singleton)
}

/// Messages of `tree` that form an applicable series, in date order.
///
/// A singleton or numbered root stands alone. Under a cover letter, or any
/// other root, only the direct replies that are numbered patches are taken.
pub fn series_for_export(tree: &MessageTree) -> Vec<&StoredMessage> {
    match classify_subject(&tree.message.subject) {
        PatchKind::Singleton | PatchKind::Numbered { .. } => vec![&tree.message],
        PatchKind::CoverLetter { .. } | PatchKind::NotPatch => {
            let mut series: Vec<&StoredMessage> = tree
                .replies
                .iter()
                .map(|reply| &reply.message)
                .filter(|m| matches!(classify_subject(&m.subject), PatchKind::Numbered { .. }))
                .collect();
            series.sort_by_key(|m| m.date_ts);
            series
        }
    }
}
