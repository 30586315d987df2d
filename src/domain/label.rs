//! Label names and normalization.
//!
//! Model-suggested labels are free text. Before they reach the store they are
//! cleaned into names the remote mailbox accepts and that stay stable across
//! runs.

use std::collections::BTreeSet;

use super::Disposition;

/// Well-known system label names.
pub mod system_labels {
    pub const INBOX: &str = "INBOX";
    pub const TRASH: &str = "TRASH";
    pub const UNREAD: &str = "UNREAD";
}

/// Default prefix for disposition marker labels.
pub const DEFAULT_MARKER_PREFIX: &str = "_AI_";

/// Maximum labels kept from one decision.
pub const MAX_LABELS: usize = 5;

/// Longer phrases are sentences, not labels.
const MAX_LABEL_WORDS: usize = 4;

/// Gmail rejects label names above this length.
const MAX_LABEL_CHARS: usize = 200;

/// Canonical spellings for labels models commonly produce in varying forms.
const CANONICAL_LABELS: &[(&str, &str)] = &[
    ("newsletter", "Newsletter"),
    ("newsletters", "Newsletter"),
    ("promotion", "Promotions"),
    ("promotions", "Promotions"),
    ("promo", "Promotions"),
    ("marketing", "Promotions"),
    ("notification", "Notifications"),
    ("notifications", "Notifications"),
    ("social", "Social"),
    ("finance", "Finance"),
    ("bank", "Finance"),
    ("invoice", "Receipts"),
    ("invoices", "Receipts"),
    ("receipt", "Receipts"),
    ("receipts", "Receipts"),
    ("travel", "Travel"),
    ("work", "Work"),
    ("personal", "Personal"),
    ("security", "Security"),
    ("shopping", "Shopping"),
];

/// Returns the marker label recording a disposition on the remote message.
pub fn disposition_marker(prefix: &str, disposition: Disposition) -> String {
    format!("{}{}", prefix, disposition.as_str().to_ascii_uppercase())
}

/// Returns the marker labels for every disposition.
pub fn all_markers(prefix: &str) -> BTreeSet<String> {
    Disposition::ALL
        .iter()
        .map(|d| disposition_marker(prefix, *d))
        .collect()
}

/// Cleans a single label name, returning `None` if nothing usable remains.
pub fn clean_label(raw: &str) -> Option<String> {
    let stripped: String = raw.chars().filter(|c| !c.is_control()).collect();
    let trimmed = stripped.trim().trim_matches('/').trim();

    if trimmed.is_empty() || trimmed.starts_with('^') {
        return None;
    }
    if trimmed.contains(['{', '}', ':', '"']) {
        return None;
    }
    if matches!(trimmed.to_ascii_lowercase().as_str(), "none" | "null" | "n/a") {
        return None;
    }
    if trimmed.split_whitespace().count() > MAX_LABEL_WORDS {
        return None;
    }

    let canonical = CANONICAL_LABELS
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
        .map(|(_, name)| name.to_string());

    Some(canonical.unwrap_or_else(|| trimmed.chars().take(MAX_LABEL_CHARS).collect()))
}

/// Cleans, de-duplicates, and caps a list of model-suggested labels.
///
/// Order of first appearance decides which labels survive the cap. Marker
/// and system labels are never accepted from model output.
pub fn normalize_labels<I, S>(raw: I, marker_prefix: &str) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let mut kept = Vec::new();

    for label in raw {
        let Some(clean) = clean_label(label.as_ref()) else {
            continue;
        };
        if clean.starts_with(marker_prefix) || is_system_label(&clean) {
            continue;
        }
        if seen.insert(clean.to_lowercase()) {
            kept.push(clean);
        }
        if kept.len() == MAX_LABELS {
            break;
        }
    }

    kept.into_iter().collect()
}

fn is_system_label(name: &str) -> bool {
    [
        system_labels::INBOX,
        system_labels::TRASH,
        system_labels::UNREAD,
        "SPAM",
        "SENT",
        "DRAFT",
        "STARRED",
        "IMPORTANT",
    ]
    .iter()
    .any(|s| s.eq_ignore_ascii_case(name))
}
