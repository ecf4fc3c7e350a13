//! Campaign-id attribution.
//!
//! A campaign-id belongs to a distributor agent when it carries the
//! distributor prefix, contains none of the system-traffic markers, and its
//! first segment looks like an agent code (letters and digits). Owner tag and
//! distributor flag always come from the same pass, so a row can never be
//! flagged as distributor-sourced without an owner or the reverse.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TrackerError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributionRules {
    pub rules_version: u32,
    pub prefix: String,
    pub separator: char,
    pub denylist: Vec<String>,
    pub min_agent_id_len: usize,
}

impl AttributionRules {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            rules_version: 1,
            prefix: "PPIPL_".to_string(),
            separator: '_',
            denylist: [
                "CHKR",
                "ENKR",
                "AF",
                "PS",
                "CCCAMPAIGN",
                "TQ",
                "BNKR",
                "FBA",
                "PAID",
            ]
            .iter()
            .map(|pattern| (*pattern).to_string())
            .collect(),
            min_agent_id_len: 3,
        }
    }

    /// Validates the rule set before it is used for classification.
    ///
    /// # Errors
    /// Returns [`TrackerError::Configuration`] when the prefix is blank, a
    /// denylist entry is blank, or a bound is zero.
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.rules_version == 0 {
            return Err(TrackerError::Configuration(
                "rules_version MUST be >= 1".to_string(),
            ));
        }

        if self.prefix.trim().is_empty() {
            return Err(TrackerError::Configuration(
                "prefix MUST be provided".to_string(),
            ));
        }

        if self.denylist.iter().any(|pattern| pattern.trim().is_empty()) {
            return Err(TrackerError::Configuration(
                "denylist entries MUST NOT be blank".to_string(),
            ));
        }

        if self.min_agent_id_len == 0 {
            return Err(TrackerError::Configuration(
                "min_agent_id_len MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a rule set from JSON.
    ///
    /// # Errors
    /// Returns [`TrackerError::Configuration`] for malformed payloads or
    /// invalid bounds.
    pub fn from_json(value: &Value) -> Result<Self, TrackerError> {
        let rules: Self = serde_json::from_value(value.clone()).map_err(|err| {
            TrackerError::Configuration(format!("invalid attribution rules JSON payload: {err}"))
        })?;
        rules.validate()?;
        Ok(rules)
    }
}

impl Default for AttributionRules {
    fn default() -> Self {
        Self::v1()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AttributionReason {
    #[serde(rename = "attributed")]
    Attributed,
    #[serde(rename = "excluded.empty")]
    EmptyInput,
    #[serde(rename = "excluded.prefix_missing")]
    PrefixMissing,
    #[serde(rename = "excluded.denylisted")]
    Denylisted,
    #[serde(rename = "excluded.agent_id_shape")]
    AgentIdShape,
}

impl AttributionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attributed => "attributed",
            Self::EmptyInput => "excluded.empty",
            Self::PrefixMissing => "excluded.prefix_missing",
            Self::Denylisted => "excluded.denylisted",
            Self::AgentIdShape => "excluded.agent_id_shape",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attribution {
    pub owner_tag: Option<String>,
    pub distributor_sourced: bool,
    pub reason: AttributionReason,
}

impl Attribution {
    fn attributed(owner_tag: String) -> Self {
        Self {
            owner_tag: Some(owner_tag),
            distributor_sourced: true,
            reason: AttributionReason::Attributed,
        }
    }

    fn excluded(reason: AttributionReason) -> Self {
        Self {
            owner_tag: None,
            distributor_sourced: false,
            reason,
        }
    }
}

/// Classifies a raw campaign-id into an owning agent tag and a
/// distributor-sourced flag. Matching is case-insensitive and the returned tag
/// is uppercased. Malformed input yields no attribution; this never fails.
#[must_use]
pub fn classify(campaign_id: Option<&str>, rules: &AttributionRules) -> Attribution {
    let Some(raw) = campaign_id.map(str::trim).filter(|value| !value.is_empty()) else {
        return Attribution::excluded(AttributionReason::EmptyInput);
    };

    let normalized = raw.to_uppercase();
    let prefix = rules.prefix.trim().to_uppercase();
    let Some(remainder) = normalized.strip_prefix(prefix.as_str()) else {
        return Attribution::excluded(AttributionReason::PrefixMissing);
    };

    let denylisted = rules.denylist.iter().any(|pattern| {
        let pattern = pattern.trim().to_uppercase();
        !pattern.is_empty() && remainder.contains(pattern.as_str())
    });
    if denylisted {
        return Attribution::excluded(AttributionReason::Denylisted);
    }

    let segment = remainder.split(rules.separator).next().unwrap_or_default();
    if is_agent_code(segment, rules.min_agent_id_len) {
        Attribution::attributed(segment.to_string())
    } else {
        Attribution::excluded(AttributionReason::AgentIdShape)
    }
}

fn is_agent_code(segment: &str, min_len: usize) -> bool {
    segment.chars().count() >= min_len
        && segment.chars().any(char::is_alphabetic)
        && segment.chars().any(char::is_numeric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn run(campaign_id: &str) -> Attribution {
        classify(Some(campaign_id), &AttributionRules::v1())
    }

    #[test]
    fn distributor_campaign_is_attributed_to_first_segment() {
        let attribution = run("PPIPL_RPM001");
        assert_eq!(attribution.owner_tag.as_deref(), Some("RPM001"));
        assert!(attribution.distributor_sourced);
        assert_eq!(attribution.reason, AttributionReason::Attributed);

        let trailing = run("PPIPL_RPM001_DROPOFF");
        assert_eq!(trailing.owner_tag.as_deref(), Some("RPM001"));
        assert!(trailing.distributor_sourced);
    }

    #[test]
    fn matching_is_case_insensitive_and_tag_is_uppercased() {
        let attribution = run("  ppipl_rpm001_web ");
        assert_eq!(attribution.owner_tag.as_deref(), Some("RPM001"));
        assert!(attribution.distributor_sourced);
    }

    #[test]
    fn missing_prefix_is_system_traffic() {
        for campaign_id in ["RPM001", "XPIPL_RPM001", "GOOGLE_ADS_2026", "PPIPLRPM001"] {
            let attribution = run(campaign_id);
            assert_eq!(attribution.owner_tag, None, "{campaign_id}");
            assert!(!attribution.distributor_sourced, "{campaign_id}");
            assert_eq!(attribution.reason, AttributionReason::PrefixMissing);
        }
    }

    #[test]
    fn empty_input_is_not_attributed() {
        let rules = AttributionRules::v1();
        for input in [None, Some(""), Some("   ")] {
            let attribution = classify(input, &rules);
            assert_eq!(attribution.owner_tag, None);
            assert!(!attribution.distributor_sourced);
            assert_eq!(attribution.reason, AttributionReason::EmptyInput);
        }
    }

    #[test]
    fn denylisted_markers_exclude_anywhere_after_prefix() {
        for campaign_id in [
            "PPIPL_CHKR001",
            "PPIPL_RPM001_PAID",
            "PPIPL_XY9_BNKR_2026",
            "ppipl_cccampaign_77",
            "PPIPL_TQ123",
        ] {
            let attribution = run(campaign_id);
            assert_eq!(attribution.owner_tag, None, "{campaign_id}");
            assert!(!attribution.distributor_sourced, "{campaign_id}");
            assert_eq!(attribution.reason, AttributionReason::Denylisted);
        }
    }

    #[test]
    fn shape_failures_are_fully_rejected() {
        for campaign_id in ["PPIPL_AB", "PPIPL_ABCDEF", "PPIPL_123456", "PPIPL_", "PPIPL__RPM001"] {
            let attribution = run(campaign_id);
            assert_eq!(attribution.owner_tag, None, "{campaign_id}");
            assert!(!attribution.distributor_sourced, "{campaign_id}");
            assert_eq!(attribution.reason, AttributionReason::AgentIdShape);
        }
    }

    #[test]
    fn shortest_accepted_code_has_min_length() {
        assert_eq!(run("PPIPL_A12").owner_tag.as_deref(), Some("A12"));
        assert_eq!(run("PPIPL_A1").owner_tag, None);
    }

    #[test]
    fn custom_rules_change_prefix_and_denylist() {
        let rules = must_ok(AttributionRules::from_json(&serde_json::json!({
            "rules_version": 2,
            "prefix": "dsa-",
            "separator": "-",
            "denylist": ["TEST"],
            "min_agent_id_len": 4
        })));

        assert_eq!(
            classify(Some("DSA-KM2044-JAN"), &rules).owner_tag.as_deref(),
            Some("KM2044")
        );
        assert_eq!(classify(Some("DSA-KM2"), &rules).owner_tag, None);
        assert_eq!(classify(Some("DSA-KM2044-TEST"), &rules).owner_tag, None);
        assert_eq!(classify(Some("PPIPL_RPM001"), &rules).owner_tag, None);
    }

    #[test]
    fn invalid_rules_are_configuration_errors() {
        let mut rules = AttributionRules::v1();
        rules.prefix = " ".to_string();
        assert!(matches!(
            rules.validate(),
            Err(TrackerError::Configuration(_))
        ));

        let mut rules = AttributionRules::v1();
        rules.denylist.push(String::new());
        assert!(rules.validate().is_err());

        let decoded = AttributionRules::from_json(&serde_json::json!({ "prefix": "PPIPL_" }));
        assert!(matches!(decoded, Err(TrackerError::Configuration(_))));
    }

    #[test]
    fn reason_codes_match_serialized_form() {
        for reason in [
            AttributionReason::Attributed,
            AttributionReason::EmptyInput,
            AttributionReason::PrefixMissing,
            AttributionReason::Denylisted,
            AttributionReason::AgentIdShape,
        ] {
            let encoded = must_ok(serde_json::to_value(reason));
            assert_eq!(encoded, serde_json::Value::String(reason.as_str().to_string()));
        }
    }

    proptest! {
        #[test]
        fn classification_is_deterministic(campaign_id in "\\PC{0,24}") {
            let rules = AttributionRules::v1();
            let first = classify(Some(&campaign_id), &rules);
            let second = classify(Some(&campaign_id), &rules);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn owner_tag_and_flag_agree(campaign_id in "(PPIPL_|ppipl_|X)?[A-Za-z0-9_]{0,16}") {
            let attribution = classify(Some(&campaign_id), &AttributionRules::v1());
            prop_assert_eq!(attribution.owner_tag.is_some(), attribution.distributor_sourced);
            if let Some(tag) = &attribution.owner_tag {
                prop_assert_eq!(tag.to_uppercase(), tag.clone());
                prop_assert!(!tag.contains('_'));
            }
        }

        #[test]
        fn reclassifying_the_raw_id_in_any_case_is_stable(code in "[A-Z]{1,4}[0-9]{1,4}") {
            let upper = format!("PPIPL_{code}");
            let lower = upper.to_lowercase();
            let rules = AttributionRules::v1();
            prop_assert_eq!(classify(Some(&upper), &rules), classify(Some(&lower), &rules));
        }
    }
}
