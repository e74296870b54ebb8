//! Namespace naming, labels, annotations, and the metadata projection.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cluster::Namespace;

pub const LABEL_LIFECYCLE: &str = "lifecycle";
pub const LIFECYCLE_TRANSIENT: &str = "transient";
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_BUCKET_ID: &str = "bucket-id";

pub const ANNOTATION_BUCKET_ID: &str = "calcbridge.io/bucket-id";
pub const ANNOTATION_CREATED_AT: &str = "calcbridge.io/created-at";
pub const ANNOTATION_LAST_ACTIVITY: &str = "calcbridge.io/last-activity";
pub const ANNOTATION_STATUS: &str = "calcbridge.io/status";
pub const ANNOTATION_FINALIZED_AT: &str = "calcbridge.io/finalized-at";
pub const ANNOTATION_REAPING_STARTED_AT: &str = "calcbridge.io/reaping-started-at";

/// Pod annotation holding integrity-violation evidence.
pub const ANNOTATION_SENTINEL_VIOLATIONS: &str = "calcbridge.io/sentinel-violations";

const NAMESPACE_PREFIX: &str = "calc-bucket-";
const MAX_NAME_LEN: usize = 63;
const HASH_SUFFIX_LEN: usize = 8;

/// Lifecycle status carried in the namespace's status annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceStatus {
    Active,
    Finalized,
    Reaping,
    /// Evidence captured and deletion about to be issued.
    Reaped,
}

impl NamespaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Finalized => "finalized",
            Self::Reaping => "reaping",
            Self::Reaped => "reaped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "finalized" => Some(Self::Finalized),
            "reaping" => Some(Self::Reaping),
            "reaped" => Some(Self::Reaped),
            _ => None,
        }
    }
}

impl std::fmt::Display for NamespaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn short_hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)[..HASH_SUFFIX_LEN].to_string()
}

/// Replace disallowed characters, trim the ends, and cap the length.
///
/// When anything had to change, a hash of the raw input is appended so two
/// inputs never collapse onto the same output. Input with nothing usable
/// left, including the empty string, maps to the hash alone.
fn sanitize(raw: &str, max_len: usize, allowed: impl Fn(char) -> bool, lowercase: bool) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| if lowercase { c.to_ascii_lowercase() } else { c })
        .map(|c| if allowed(c) { c } else { '-' })
        .collect();
    let trimmed = mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric());

    if !trimmed.is_empty() && trimmed == raw && trimmed.len() <= max_len {
        return trimmed.to_string();
    }

    let hash = short_hash(raw);
    let keep = max_len - HASH_SUFFIX_LEN - 1;
    let head: String = trimmed.chars().take(keep).collect();
    let head = head.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    if head.is_empty() {
        hash
    } else {
        format!("{head}-{hash}")
    }
}

/// Deterministic namespace name for a bucket, a valid DNS-1123 label.
pub fn namespace_name(bucket_id: &str) -> String {
    let slug = sanitize(
        bucket_id,
        MAX_NAME_LEN - NAMESPACE_PREFIX.len(),
        |c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-',
        true,
    );
    format!("{NAMESPACE_PREFIX}{slug}")
}

/// Label-safe form of a bucket ID for the `bucket-id` label.
pub fn bucket_label_value(bucket_id: &str) -> String {
    sanitize(
        bucket_id,
        MAX_NAME_LEN,
        |c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'),
        false,
    )
}

/// Labels identifying a namespace the orchestrator owns.
pub fn management_labels(platform: &str) -> Vec<(&'static str, String)> {
    vec![
        (LABEL_LIFECYCLE, LIFECYCLE_TRANSIENT.to_string()),
        (LABEL_MANAGED_BY, platform.to_string()),
    ]
}

fn parse_timestamp(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Orchestrator view of one bucket namespace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceMetadata {
    pub namespace: String,
    pub bucket_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: NamespaceStatus,
    pub pod_count: usize,
    pub claim_count: usize,
}

impl NamespaceMetadata {
    /// Rebuild metadata from a namespace's labels and annotations.
    ///
    /// Missing or unreadable timestamps default to `now`; a missing status
    /// reads as active.
    pub fn from_namespace(
        namespace: &Namespace,
        pod_count: usize,
        claim_count: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let meta = &namespace.metadata;
        let annotations: &BTreeMap<String, String> = &meta.annotations;

        let bucket_id = annotations
            .get(ANNOTATION_BUCKET_ID)
            .or_else(|| meta.labels.get(LABEL_BUCKET_ID))
            .cloned()
            .unwrap_or_default();

        Self {
            namespace: meta.name.clone(),
            bucket_id,
            created_at: parse_timestamp(annotations.get(ANNOTATION_CREATED_AT)).unwrap_or(now),
            last_activity: parse_timestamp(annotations.get(ANNOTATION_LAST_ACTIVITY))
                .unwrap_or(now),
            status: annotations
                .get(ANNOTATION_STATUS)
                .and_then(|s| NamespaceStatus::parse(s))
                .unwrap_or(NamespaceStatus::Active),
            pod_count,
            claim_count,
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.last_activity
    }

    /// Finalized, or idle strictly longer than `threshold`.
    pub fn is_cleanup_eligible(&self, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
        self.status == NamespaceStatus::Finalized || self.idle_for(now) > threshold
    }
}
