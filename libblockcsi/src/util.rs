//! Size arithmetic, idempotency tokens and tag validation.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::cloud::TAG_VOLUME_NAME;
use crate::error::CsiError;
use crate::types::CapacityRange;

pub const GIB: u64 = 1 << 30;
pub const DEFAULT_VOLUME_SIZE: u64 = 100 * GIB;

const MAX_EXTRA_TAGS: usize = 50;
const MAX_TAG_KEY_LEN: usize = 128;
const MAX_TAG_VALUE_LEN: usize = 256;
const RESERVED_TAG_PREFIXES: &[&str] = &["kubernetes.io", "osc:"];

/// Bytes rounded up to whole GiB.
pub fn round_up_gib(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

/// Size in GiB for a capacity range: the required size rounded up, or the
/// default when nothing is required.  Exceeding a set limit is an error.
pub fn capacity_gib(range: Option<&CapacityRange>) -> Result<u64, CsiError> {
    let (required, limit) = range.map_or((0, 0), |r| (r.required_bytes, r.limit_bytes));
    let wanted = match (required, limit) {
        (0, 0) => DEFAULT_VOLUME_SIZE,
        (0, l) => l.min(DEFAULT_VOLUME_SIZE),
        (r, _) => r,
    };
    if limit > 0 && required > limit {
        return Err(CsiError::InvalidArgument(format!(
            "required bytes {required} exceed limit bytes {limit}"
        )));
    }
    let gib = round_up_gib(wanted).max(1);
    if limit > 0 && gib.saturating_mul(GIB) > limit {
        return Err(CsiError::InvalidArgument(format!(
            "{gib} GiB (rounded up) exceeds limit bytes {limit}"
        )));
    }
    Ok(gib)
}

/// Token binding a volume name to the parameters it was created with.
///
/// Parameter keys are lower-cased and sorted so equivalent requests hash the
/// same.
pub fn volume_token(
    name: &str,
    params: &HashMap<String, String>,
    size_gib: u64,
    source_snapshot: Option<&str>,
) -> String {
    let mut normalized: Vec<(String, &str)> = params
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .collect();
    normalized.sort();

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    for (k, v) in &normalized {
        hasher.update(format!("{k}={v}\n").as_bytes());
    }
    hasher.update(format!("size={size_gib}\n").as_bytes());
    hasher.update(format!("snapshot={}\n", source_snapshot.unwrap_or_default()).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn snapshot_token(name: &str, source_volume_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{name}\n{source_volume_id}\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// Check operator-supplied tags against the provider's limits.
pub fn validate_extra_tags(tags: &HashMap<String, String>) -> Result<(), CsiError> {
    if tags.len() > MAX_EXTRA_TAGS {
        return Err(CsiError::InvalidArgument(format!(
            "too many extra tags: {} > {MAX_EXTRA_TAGS}",
            tags.len()
        )));
    }
    for (k, v) in tags {
        if k.is_empty() || k.chars().count() > MAX_TAG_KEY_LEN {
            return Err(CsiError::InvalidArgument(format!(
                "tag key {k:?} must be 1..={MAX_TAG_KEY_LEN} characters"
            )));
        }
        if v.chars().count() > MAX_TAG_VALUE_LEN {
            return Err(CsiError::InvalidArgument(format!(
                "value of tag {k:?} is longer than {MAX_TAG_VALUE_LEN} characters"
            )));
        }
        if k == TAG_VOLUME_NAME {
            return Err(CsiError::InvalidArgument(format!("tag key {k:?} is reserved")));
        }
        if let Some(prefix) = RESERVED_TAG_PREFIXES.iter().find(|p| k.starts_with(*p)) {
            return Err(CsiError::InvalidArgument(format!(
                "tag key {k:?} uses reserved prefix {prefix:?}"
            )));
        }
    }
    Ok(())
}

/// Parse `k1=v1,k2=v2`.  Whitespace around items is ignored.
pub fn parse_key_value_list(raw: &str) -> Result<HashMap<String, String>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| format!("expected key=value, got {item:?}"))
        })
        .collect()
}

/// Drop repeated entries, keeping first occurrences in order.
pub fn dedup_flags<I>(flags: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for f in flags {
        if !f.is_empty() && !out.contains(&f) {
            out.push(f);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(required: u64, limit: u64) -> Option<CapacityRange> {
        Some(CapacityRange {
            required_bytes: required,
            limit_bytes: limit,
        })
    }

    #[test]
    fn capacity_rounding_and_limits() {
        assert_eq!(capacity_gib(None).unwrap(), 100);
        assert_eq!(capacity_gib(range(1, 0).as_ref()).unwrap(), 1);
        assert_eq!(capacity_gib(range(GIB + 1, 0).as_ref()).unwrap(), 2);
        assert_eq!(capacity_gib(range(0, 10 * GIB).as_ref()).unwrap(), 10);
        assert_eq!(capacity_gib(range(4 * GIB, 4 * GIB).as_ref()).unwrap(), 4);

        assert!(capacity_gib(range(GIB + 1, GIB + 100).as_ref()).is_err());
        assert!(capacity_gib(range(5 * GIB, 4 * GIB).as_ref()).is_err());
    }

    #[test]
    fn token_normalizes_keys() {
        let a = HashMap::from([("Type".to_owned(), "io1".to_owned())]);
        let b = HashMap::from([("type".to_owned(), "io1".to_owned())]);
        let c = HashMap::from([("type".to_owned(), "gp2".to_owned())]);
        assert_eq!(volume_token("pv", &a, 4, None), volume_token("pv", &b, 4, None));
        assert_ne!(volume_token("pv", &b, 4, None), volume_token("pv", &c, 4, None));
        assert_ne!(volume_token("pv", &b, 4, None), volume_token("pv", &b, 5, None));
        assert_ne!(
            volume_token("pv", &b, 4, None),
            volume_token("pv", &b, 4, Some("snap-1"))
        );
        assert_eq!(volume_token("pv", &b, 4, None).len(), 64);
        assert_ne!(snapshot_token("s", "vol-1"), snapshot_token("s", "vol-2"));
    }

    #[test]
    fn extra_tag_rules() {
        let ok = HashMap::from([("team".to_owned(), "storage".to_owned())]);
        assert!(validate_extra_tags(&ok).is_ok());

        for (k, v) in [
            ("CSIVolumeName", "x"),
            ("kubernetes.io/cluster", "x"),
            ("osc:owner", "x"),
            ("", "x"),
        ] {
            let tags = HashMap::from([(k.to_owned(), v.to_owned())]);
            assert!(validate_extra_tags(&tags).is_err(), "{k} should be rejected");
        }

        let long_key = HashMap::from([("k".repeat(129), String::new())]);
        assert!(validate_extra_tags(&long_key).is_err());
        let long_value = HashMap::from([("k".to_owned(), "v".repeat(257))]);
        assert!(validate_extra_tags(&long_value).is_err());

        let many: HashMap<String, String> =
            (0..51).map(|i| (format!("k{i}"), String::new())).collect();
        assert!(validate_extra_tags(&many).is_err());
    }

    #[test]
    fn key_value_lists() {
        let parsed = parse_key_value_list("a=1, b = 2,,").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["b"], "2");
        assert!(parse_key_value_list("novalue").is_err());
        assert!(parse_key_value_list("").unwrap().is_empty());
    }

    #[test]
    fn flags_dedup_in_order() {
        let flags = ["ro", "noatime", "ro", ""].map(String::from);
        assert_eq!(dedup_flags(flags), vec!["ro".to_owned(), "noatime".to_owned()]);
    }
}
