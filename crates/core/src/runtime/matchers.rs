//! Rule matcher evaluation, spec.md section 4.6: inspects a Connection's
//! negotiated media and its metadata. Pure, side-effect-free predicates
//! dispatched from the closed `MatcherDefinition` variant set.

use mockrtc_protocol::{MatcherDefinition, MediaKind, ParsedSdp};
use regex::Regex;
use url::Url;

use crate::connection::Connection;

pub async fn evaluate(matcher: &MatcherDefinition, connection: &Connection) -> bool {
    match matcher {
        MatcherDefinition::HasDataChannel => has_section(connection, MediaKind::Application).await,
        MatcherDefinition::HasVideoTrack => has_section(connection, MediaKind::Video).await,
        MatcherDefinition::HasAudioTrack => has_section(connection, MediaKind::Audio).await,
        MatcherDefinition::HasMediaTrack => {
            has_section(connection, MediaKind::Video).await
                || has_section(connection, MediaKind::Audio).await
        }
        MatcherDefinition::PageHostname { hostname } => source_url(connection)
            .await
            .map(|url| url.host_str() == Some(hostname.as_str()))
            .unwrap_or(false),
        MatcherDefinition::PageRegex { source, flags } => {
            let value = source_url(connection).await.map(|url| url.to_string());
            match_regex(source, flags, value)
        }
        MatcherDefinition::UserAgentRegex { source, flags } => {
            let value = connection.metadata().await.user_agent;
            match_regex(source, flags, value)
        }
    }
}

async fn has_section(connection: &Connection, kind: MediaKind) -> bool {
    let contains = |parsed: ParsedSdp| parsed.media.iter().any(|m| m.kind == kind);
    let local = connection.local_description().await.map(|d| d.parsed());
    let remote = connection.remote_description().await.map(|d| d.parsed());
    local.map(contains).unwrap_or(false) || remote.map(contains).unwrap_or(false)
}

async fn source_url(connection: &Connection) -> Option<Url> {
    let source_url = connection.metadata().await.source_url?;
    Url::parse(&source_url).ok()
}

fn match_regex(source: &str, flags: &str, value: Option<String>) -> bool {
    let Some(value) = value else {
        return false;
    };
    let pattern = if flags.contains('i') {
        format!("(?i){source}")
    } else {
        source.to_string()
    };
    Regex::new(&pattern)
        .map(|re| re.is_match(&value))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_match_is_case_insensitive_with_i_flag() {
        assert!(match_regex("HELLO", "i", Some("say hello there".to_string())));
        assert!(!match_regex("HELLO", "", Some("say hello there".to_string())));
    }

    #[test]
    fn regex_match_is_false_without_metadata() {
        assert!(!match_regex("x=y", "", None));
    }
}
