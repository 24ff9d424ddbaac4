//! Semantic SDP transform: given a foreign parsed SDP, produce a locally
//! generated SDP that negotiates the same m-sections, mids, payload types,
//! directions and SSRCs, but with this Connection's own fingerprint and ICE
//! credentials (spec.md section 4.4). Grounded on the teacher's `handle_offer`
//! offer/answer dance in `connection::mod`, layered with the structured
//! rewrite `mockrtc_protocol::sdp::ParsedSdp::apply_to` already does for us.

use std::sync::Arc;

use mockrtc_protocol::{MediaKind, MockRtcError, ParsedSdp, SessionDescription};

use crate::connection::{capability_from_rtpmap, Connection, ConnectionState};

/// Rules 1-4 of spec.md section 4.4, offer side.
pub async fn mirror_for_offer(
    connection: &Arc<Connection>,
    source: &ParsedSdp,
    force_add_data_stream: bool,
) -> Result<SessionDescription, MockRtcError> {
    let existing_tracks = connection.tracks().await;
    for section in source.non_application() {
        if existing_tracks.iter().any(|t| t.mid() == section.mid) {
            continue;
        }
        let payload = section.payloads.first().copied().unwrap_or(0);
        let capability = capability_from_rtpmap(section.kind, &section.rtp, payload);
        connection
            .add_local_media_track(&section.mid, section.kind, section.direction, capability)
            .await?;
    }

    let no_media_yet_and_new = source.non_application().next().is_none()
        && connection.state().await == ConnectionState::New;
    let needs_setup_channel =
        source.has_application_section() || no_media_yet_and_new || force_add_data_stream;

    let setup_channel = if needs_setup_channel {
        Some(
            connection
                .create_data_channel(crate::connection::SETUP_CHANNEL_LABEL)
                .await?,
        )
    } else {
        None
    };

    let offer = connection.build_local_offer().await?;

    if let Some(channel) = setup_channel {
        channel.close().await?;
    }

    apply_mirror(&offer, source)
}

/// Offer mirroring already set the remote description before this is
/// called; produce the normal local answer and overwrite media parameters
/// from the source answer (spec.md section 4.4, answer rules).
pub async fn mirror_for_answer(
    connection: &Arc<Connection>,
    source: &ParsedSdp,
) -> Result<SessionDescription, MockRtcError> {
    let answer = connection.build_local_answer().await?;
    apply_mirror(&answer, source)
}

fn apply_mirror(
    local: &SessionDescription,
    source: &ParsedSdp,
) -> Result<SessionDescription, MockRtcError> {
    let parsed_local = local.parsed();

    for section in &source.media {
        if section.kind == MediaKind::Application {
            continue;
        }
        let target = parsed_local.section_by_mid(&section.mid).ok_or_else(|| {
            MockRtcError::MirrorMismatch(format!("source mid {} missing from local offer", section.mid))
        })?;
        if target.kind != section.kind {
            return Err(MockRtcError::MirrorMismatch(format!(
                "type mismatch for mid {}: local {:?} vs source {:?}",
                section.mid, target.kind, section.kind
            )));
        }
    }

    let mut mirrored = parsed_local;
    mirrored.msid_semantic = source.msid_semantic.clone();
    for target in mirrored.media.iter_mut() {
        if target.kind == MediaKind::Application {
            continue;
        }
        let Some(source_section) = source.section_by_mid(&target.mid) else {
            continue;
        };
        target.msid = source_section.msid.clone();
        target.protocol = source_section.protocol.clone();
        target.ext = source_section.ext.clone();
        target.payloads = source_section.payloads.clone();
        target.rtp = source_section.rtp.clone();
        target.fmtp = source_section.fmtp.clone();
        target.rtcp = source_section.rtcp.clone();
        target.rtcp_fb = source_section.rtcp_fb.clone();
        target.ssrc_groups = source_section.ssrc_groups.clone();
        target.ssrcs = source_section.ssrcs.clone();
    }

    let rewritten_sdp = mirrored.apply_to(&local.sdp);
    Ok(SessionDescription {
        kind: local.kind,
        sdp: rewritten_sdp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockrtc_protocol::{Direction, MediaSection, SdpType};
    use std::collections::BTreeMap;

    fn section(mid: &str, kind: MediaKind) -> MediaSection {
        MediaSection {
            mid: mid.to_string(),
            kind,
            direction: Direction::Sendrecv,
            protocol: "UDP/TLS/RTP/SAVPF".to_string(),
            payloads: vec![111],
            rtp: BTreeMap::from([(111, "opus/48000/2".to_string())]),
            fmtp: BTreeMap::new(),
            rtcp: None,
            rtcp_fb: BTreeMap::new(),
            ext: Vec::new(),
            ssrcs: Vec::new(),
            ssrc_groups: Vec::new(),
            msid: Some("stream track".to_string()),
            other_attributes: Vec::new(),
        }
    }

    #[test]
    fn apply_mirror_fails_on_missing_mid() {
        let local = SessionDescription::offer(
            "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string(),
        );
        let source = ParsedSdp {
            msid_semantic: None,
            media: vec![section("0", MediaKind::Audio)],
        };
        let result = apply_mirror(&local, &source);
        assert!(matches!(result, Err(MockRtcError::MirrorMismatch(_))));
    }

    #[test]
    fn apply_mirror_fails_on_type_mismatch() {
        let local_sdp = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\na=sendrecv\r\n";
        let local = SessionDescription {
            kind: SdpType::Offer,
            sdp: local_sdp.to_string(),
        };
        let source = ParsedSdp {
            msid_semantic: None,
            media: vec![section("0", MediaKind::Audio)],
        };
        let result = apply_mirror(&local, &source);
        assert!(matches!(result, Err(MockRtcError::MirrorMismatch(_))));
    }

    #[test]
    fn apply_mirror_copies_media_parameters() {
        let local_sdp = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=sendrecv\r\na=fingerprint:sha-256 AA:BB\r\n";
        let local = SessionDescription {
            kind: SdpType::Offer,
            sdp: local_sdp.to_string(),
        };
        let mut source_section = section("0", MediaKind::Audio);
        source_section.msid = Some("mirrored-stream mirrored-track".to_string());
        let source = ParsedSdp {
            msid_semantic: Some("WMS mirrored-stream".to_string()),
            media: vec![source_section],
        };

        let mirrored = apply_mirror(&local, &source).unwrap();
        assert!(mirrored.sdp.contains("mirrored-stream mirrored-track"));
        assert!(mirrored.sdp.contains("a=fingerprint:sha-256 AA:BB"));
    }
}
