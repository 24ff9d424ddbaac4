//! Matcher *definitions* and rule lists, spec.md sections 3 and 4.6.

use serde::{Deserialize, Serialize};

use crate::steps::StepDefinition;

/// The closed set of matcher variants. Regex matchers carry their source
/// and flags separately (rather than a compiled `Regex`) so this type stays
/// plain data across an RPC boundary; `mockrtc-core::runtime::matchers`
/// compiles them once when a rule is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "matcher", rename_all = "kebab-case")]
pub enum MatcherDefinition {
    HasDataChannel,
    HasVideoTrack,
    HasAudioTrack,
    HasMediaTrack,
    PageHostname { hostname: String },
    PageRegex { source: String, flags: String },
    UserAgentRegex { source: String, flags: String },
}

/// `{ matchers[], steps[] }`. The matching peer evaluates an ordered list of
/// these in insertion order; the first rule whose matchers are all true
/// supplies the steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub matchers: Vec<MatcherDefinition>,
    pub steps: Vec<StepDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_tag_is_kebab_case() {
        let matcher = MatcherDefinition::PageHostname {
            hostname: "example.com".into(),
        };
        let json = serde_json::to_string(&matcher).unwrap();
        assert!(json.contains(r#""matcher":"page-hostname""#));
    }

    #[test]
    fn rule_round_trips_through_json() {
        let rule = Rule {
            matchers: vec![MatcherDefinition::HasAudioTrack],
            steps: vec![StepDefinition::Close],
        };
        let json = serde_json::to_string(&rule).unwrap();
        let parsed: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rule);
    }
}
