//! Indicator (IOC) extraction from fetched text
//!
//! A fixed catalog of pattern matchers over free text. Extraction is
//! deterministic: same input, same categorized output, independent of call
//! order. Types match independently; a token may land in more than one
//! category (an MD5-length hex string inside a longer SHA string, for
//! example).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Categories of extracted indicators
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorType {
    Ipv4,
    Ipv6,
    Domain,
    Onion,
    Email,
    Url,
    Md5,
    Sha1,
    Sha256,
    Bitcoin,
    Ethereum,
    Phone,
}

impl IndicatorType {
    /// All types, in output order
    pub const ALL: &'static [IndicatorType] = &[
        IndicatorType::Ipv4,
        IndicatorType::Ipv6,
        IndicatorType::Domain,
        IndicatorType::Onion,
        IndicatorType::Email,
        IndicatorType::Url,
        IndicatorType::Md5,
        IndicatorType::Sha1,
        IndicatorType::Sha256,
        IndicatorType::Bitcoin,
        IndicatorType::Ethereum,
        IndicatorType::Phone,
    ];

    /// Tag used in exports
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorType::Ipv4 => "ipv4",
            IndicatorType::Ipv6 => "ipv6",
            IndicatorType::Domain => "domain",
            IndicatorType::Onion => "onion",
            IndicatorType::Email => "email",
            IndicatorType::Url => "url",
            IndicatorType::Md5 => "md5",
            IndicatorType::Sha1 => "sha1",
            IndicatorType::Sha256 => "sha256",
            IndicatorType::Bitcoin => "bitcoin",
            IndicatorType::Ethereum => "ethereum",
            IndicatorType::Phone => "phone",
        }
    }
}

/// Indicator-type tag mapped to the distinct values seen.
///
/// BTreeMap/BTreeSet keep iteration order stable so exports and merges are
/// reproducible. Union-merge is associative, commutative, and idempotent.
pub type IndicatorMap = BTreeMap<IndicatorType, BTreeSet<String>>;

static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b").unwrap()
});

static IPV6_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}\b").unwrap()
});

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}\b").unwrap()
});

static ONION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-z2-7]{16,56}\.onion\b").unwrap());

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b").unwrap()
});

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#).unwrap());

static MD5_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[a-fA-F0-9]{32}\b").unwrap());

static SHA1_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[a-fA-F0-9]{40}\b").unwrap());

static SHA256_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[a-fA-F0-9]{64}\b").unwrap());

static BITCOIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[13][a-km-zA-HJ-NP-Z1-9]{25,34}\b").unwrap());

static ETHEREUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[a-fA-F0-9]{40}\b").unwrap());

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\+?1[-.\s]?)?\(?[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b").unwrap()
});

fn pattern_for(indicator_type: IndicatorType) -> &'static Regex {
    match indicator_type {
        IndicatorType::Ipv4 => &IPV4_RE,
        IndicatorType::Ipv6 => &IPV6_RE,
        IndicatorType::Domain => &DOMAIN_RE,
        IndicatorType::Onion => &ONION_RE,
        IndicatorType::Email => &EMAIL_RE,
        IndicatorType::Url => &URL_RE,
        IndicatorType::Md5 => &MD5_RE,
        IndicatorType::Sha1 => &SHA1_RE,
        IndicatorType::Sha256 => &SHA256_RE,
        IndicatorType::Bitcoin => &BITCOIN_RE,
        IndicatorType::Ethereum => &ETHEREUM_RE,
        IndicatorType::Phone => &PHONE_RE,
    }
}

/// Extract indicators from text.
///
/// `types` narrows extraction to the requested categories; `None` runs the
/// full catalog. Categories with zero matches are omitted from the result.
pub fn extract(text: &str, types: Option<&[IndicatorType]>) -> IndicatorMap {
    let requested = types.unwrap_or(IndicatorType::ALL);
    let mut indicators = IndicatorMap::new();

    for &indicator_type in requested {
        let mut values: BTreeSet<String> = BTreeSet::new();

        for m in pattern_for(indicator_type).find_iter(text) {
            // A bare-domain match that is really the host of an email address
            // is already reported as Email; skip it here.
            if indicator_type == IndicatorType::Domain
                && m.start() > 0
                && text.as_bytes()[m.start() - 1] == b'@'
            {
                continue;
            }
            values.insert(m.as_str().to_string());
        }

        if !values.is_empty() {
            indicators.insert(indicator_type, values);
        }
    }

    indicators
}

/// Set-union merge of indicator maps. Associative, commutative, idempotent.
pub fn merge<I>(maps: I) -> IndicatorMap
where
    I: IntoIterator<Item = IndicatorMap>,
{
    let mut merged = IndicatorMap::new();
    for map in maps {
        for (indicator_type, values) in map {
            merged.entry(indicator_type).or_default().extend(values);
        }
    }
    merged
}

/// Serialize an indicator map as pretty JSON keyed by type tag
pub fn to_json(indicators: &IndicatorMap) -> String {
    let by_tag: BTreeMap<&str, &BTreeSet<String>> = indicators
        .iter()
        .map(|(t, v)| (t.as_str(), v))
        .collect();
    serde_json::to_string_pretty(&by_tag).unwrap_or_else(|_| "{}".to_string())
}

/// Render an indicator map as `type,value` CSV lines with a header
pub fn to_csv(indicators: &IndicatorMap) -> String {
    let mut lines = vec!["indicator_type,value".to_string()];
    for (indicator_type, values) in indicators {
        for value in values {
            lines.push(format!("{},{}", indicator_type.as_str(), value));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_scenario() {
        let text = "Contact admin@example.com at 1.2.3.4, hash \
                    d41d8cd98f00b204e9800998ecf8427e (MD5), BTC \
                    1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
        let indicators = extract(text, None);

        let expect = |t: IndicatorType, v: &str| {
            assert_eq!(
                indicators.get(&t).map(|s| s.iter().cloned().collect::<Vec<_>>()),
                Some(vec![v.to_string()]),
                "wrong values for {:?}",
                t
            );
        };
        expect(IndicatorType::Email, "admin@example.com");
        expect(IndicatorType::Ipv4, "1.2.3.4");
        expect(IndicatorType::Md5, "d41d8cd98f00b204e9800998ecf8427e");
        expect(IndicatorType::Bitcoin, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa");
        assert_eq!(indicators.len(), 4, "unexpected categories: {:?}", indicators.keys());
    }

    #[test]
    fn test_domain_outside_email_still_matches() {
        let indicators = extract("seen on leakforum.net and via admin@example.com", None);
        let domains = indicators.get(&IndicatorType::Domain).unwrap();
        assert!(domains.contains("leakforum.net"));
        assert!(!domains.contains("example.com"));
    }

    #[test]
    fn test_onion_and_url() {
        let text = "mirror at http://dreadytofatroptsdj6io7l3xptbet6onoyno2yv7jicoxknyazubrad.onion/forum";
        let indicators = extract(text, None);
        assert!(indicators.contains_key(&IndicatorType::Onion));
        assert!(indicators.contains_key(&IndicatorType::Url));
    }

    #[test]
    fn test_hash_lengths_do_not_cross_match() {
        // Word boundaries keep a 64-hex digest from also matching the
        // shorter hash patterns.
        let sha256 = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let indicators = extract(sha256, None);
        assert!(indicators.contains_key(&IndicatorType::Sha256));
        assert!(!indicators.contains_key(&IndicatorType::Md5));
        assert!(!indicators.contains_key(&IndicatorType::Sha1));
    }

    #[test]
    fn test_requested_types_only() {
        let text = "admin@example.com at 1.2.3.4";
        let indicators = extract(text, Some(&[IndicatorType::Email]));
        assert_eq!(indicators.len(), 1);
        assert!(indicators.contains_key(&IndicatorType::Email));
    }

    fn sample_map(values: &[(&str, IndicatorType)]) -> IndicatorMap {
        let mut map = IndicatorMap::new();
        for (value, indicator_type) in values {
            map.entry(*indicator_type)
                .or_default()
                .insert(value.to_string());
        }
        map
    }

    #[test]
    fn test_merge_laws() {
        let a = sample_map(&[("1.2.3.4", IndicatorType::Ipv4), ("a@b.io", IndicatorType::Email)]);
        let b = sample_map(&[("5.6.7.8", IndicatorType::Ipv4)]);

        let ab = merge([a.clone(), b.clone()]);
        let ba = merge([b.clone(), a.clone()]);
        assert_eq!(ab, ba, "merge must be commutative");

        let ab_again = merge([ab.clone(), a.clone()]);
        assert_eq!(ab_again, ab, "merge must be idempotent");
    }

    #[test]
    fn test_csv_export() {
        let map = sample_map(&[("1.2.3.4", IndicatorType::Ipv4)]);
        let csv = to_csv(&map);
        assert!(csv.starts_with("indicator_type,value"));
        assert!(csv.contains("ipv4,1.2.3.4"));
    }
}
