//! The session description data model from spec section 3, plus the
//! hand-rolled SDP parser/serializer that backs it.
//!
//! `webrtc-rs` gives us the opaque `{type, sdp}` pair (its own
//! `RTCSessionDescription`); this module is the structured "semantic" layer
//! on top of the raw text that the SDP Mirror needs to reason about
//! m-sections, payload types and SSRCs. Mirrors the split the original
//! tooling makes between the browser's native session description object
//! and a separate structured SDP parse.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// `{ type, sdp }`. `parsed` is derived on demand from `sdp`, never stored,
/// so a mutation always re-serializes through [`ParsedSdp::to_sdp_string`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Parse `self.sdp` into the structured model. Cheap enough to call on
    /// demand rather than caching: SDPs here are a handful of m-sections.
    pub fn parsed(&self) -> ParsedSdp {
        ParsedSdp::parse(&self.sdp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Application,
    Audio,
    Video,
}

impl MediaKind {
    fn from_m_line_media(media: &str) -> Self {
        match media {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => MediaKind::Application,
        }
    }

    fn as_m_line_media(self) -> &'static str {
        match self {
            MediaKind::Application => "application",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sendrecv,
    Sendonly,
    Recvonly,
    Inactive,
}

impl Direction {
    fn from_attr(name: &str) -> Option<Self> {
        match name {
            "sendrecv" => Some(Direction::Sendrecv),
            "sendonly" => Some(Direction::Sendonly),
            "recvonly" => Some(Direction::Recvonly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    pub fn as_attr(self) -> &'static str {
        match self {
            Direction::Sendrecv => "sendrecv",
            Direction::Sendonly => "sendonly",
            Direction::Recvonly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub address: String,
    pub port: u16,
    pub protocol: TransportProtocol,
    #[serde(rename = "type")]
    pub candidate_type: CandidateType,
}

/// One `a=ssrc:<id> <attribute>:<value>` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrcEntry {
    pub id: u32,
    pub attribute: String,
    pub value: String,
}

/// One `a=ssrc-group:<semantics> <id> <id> ...` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrcGroup {
    pub semantics: String,
    pub ssrcs: Vec<u32>,
}

/// A single media (`m=`) section, parsed out of the raw SDP text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSection {
    pub mid: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub direction: Direction,
    pub protocol: String,
    pub payloads: Vec<u8>,
    /// `a=rtpmap:<pt> <encoding>` lines, keyed by payload type.
    pub rtp: BTreeMap<u8, String>,
    /// `a=fmtp:<pt> <params>` lines, keyed by payload type.
    pub fmtp: BTreeMap<u8, String>,
    /// `a=rtcp:<port> ...` line, verbatim, if present.
    pub rtcp: Option<String>,
    /// `a=rtcp-fb:<pt> ...` lines, keyed by payload type.
    pub rtcp_fb: BTreeMap<u8, Vec<String>>,
    /// `a=extmap:<id> <uri>` lines, verbatim.
    pub ext: Vec<String>,
    pub ssrcs: Vec<SsrcEntry>,
    pub ssrc_groups: Vec<SsrcGroup>,
    pub msid: Option<String>,
    /// Any attribute lines not otherwise modelled, preserved so round-trip
    /// serialization doesn't lose fingerprints / ice-ufrag / candidates.
    pub other_attributes: Vec<String>,
}

impl MediaSection {
    fn empty(mid: String, kind: MediaKind, protocol: String) -> Self {
        Self {
            mid,
            kind,
            direction: Direction::Sendrecv,
            protocol,
            payloads: Vec::new(),
            rtp: BTreeMap::new(),
            fmtp: BTreeMap::new(),
            rtcp: None,
            rtcp_fb: BTreeMap::new(),
            ext: Vec::new(),
            ssrcs: Vec::new(),
            ssrc_groups: Vec::new(),
            msid: None,
            other_attributes: Vec::new(),
        }
    }
}

/// The structured form of an SDP document: session-level `msid-semantic`
/// plus an ordered list of media sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSdp {
    pub msid_semantic: Option<String>,
    pub media: Vec<MediaSection>,
}

impl ParsedSdp {
    pub fn section_by_mid(&self, mid: &str) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.mid == mid)
    }

    pub fn non_application(&self) -> impl Iterator<Item = &MediaSection> {
        self.media.iter().filter(|m| m.kind != MediaKind::Application)
    }

    pub fn has_application_section(&self) -> bool {
        self.media.iter().any(|m| m.kind == MediaKind::Application)
    }

    /// Parse a raw SDP string. Deliberately forgiving: unknown attribute
    /// lines are kept verbatim in `other_attributes` rather than rejected,
    /// since the mirror only needs to rewrite a known subset of fields.
    pub fn parse(sdp: &str) -> Self {
        let mut msid_semantic = None;
        let mut media = Vec::new();
        let mut current: Option<MediaSection> = None;

        for raw_line in sdp.lines() {
            let line = raw_line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("m=") {
                if let Some(section) = current.take() {
                    media.push(section);
                }
                let mut parts = rest.split_whitespace();
                let media_type = parts.next().unwrap_or("application");
                let _port = parts.next();
                let proto = parts.next().unwrap_or("UDP/DTLS/SCTP").to_string();
                current = Some(MediaSection::empty(
                    String::new(),
                    MediaKind::from_m_line_media(media_type),
                    proto,
                ));
                continue;
            }

            if let Some(rest) = line.strip_prefix("a=") {
                if let Some(section) = current.as_mut() {
                    apply_media_attribute(section, rest);
                } else if let Some(value) = rest.strip_prefix("msid-semantic:") {
                    msid_semantic = Some(value.trim().to_string());
                }
            }
        }
        if let Some(section) = current.take() {
            media.push(section);
        }

        Self { msid_semantic, media }
    }

    /// Re-serialize this parsed form back onto a raw SDP string, preserving
    /// every line the parser didn't model (session header, fingerprint,
    /// ice-ufrag/pwd, candidates) and rewriting only the fields this struct
    /// owns for each matching `m=` section (matched positionally by mid).
    pub fn apply_to(&self, original_sdp: &str) -> String {
        let mut out = String::with_capacity(original_sdp.len());
        let mut section_idx: Option<usize> = None;

        for raw_line in original_sdp.lines() {
            let line = raw_line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("m=") {
                let mut parts = rest.split_whitespace();
                let media_type = parts.next().unwrap_or("application");
                let port = parts.next().unwrap_or("9");
                let idx = self
                    .media
                    .iter()
                    .position(|m| m.kind.as_m_line_media() == media_type)
                    .filter(|i| !already_used(&section_idx, *i));
                section_idx = idx;
                if let Some(i) = idx {
                    let section = &self.media[i];
                    out.push_str(&format!(
                        "m={} {} {} {}\r\n",
                        section.kind.as_m_line_media(),
                        port,
                        section.protocol,
                        section
                            .payloads
                            .iter()
                            .map(|p| p.to_string())
                            .collect::<Vec<_>>()
                            .join(" ")
                    ));
                    write_media_attributes(&mut out, section);
                } else {
                    out.push_str(raw_line);
                    out.push_str("\r\n");
                }
                continue;
            }

            if section_idx.is_some() && line.starts_with("a=") {
                // Attribute lines of a rewritten section are emitted by
                // `write_media_attributes` above; skip the originals we own.
                if is_owned_attribute(line) {
                    continue;
                }
            }

            out.push_str(raw_line);
            out.push_str("\r\n");
        }

        out
    }
}

fn already_used(last: &Option<usize>, candidate: usize) -> bool {
    // Positional matching only needs to avoid re-matching the section we
    // just emitted when two m-lines share a media type (e.g. two video
    // tracks); real matching for the mirror happens by `mid` beforehand.
    matches!(last, Some(l) if *l == candidate)
}

fn is_owned_attribute(line: &str) -> bool {
    let rest = &line[2..];
    rest.starts_with("mid:")
        || rest.starts_with("sendrecv")
        || rest.starts_with("sendonly")
        || rest.starts_with("recvonly")
        || rest.starts_with("inactive")
        || rest.starts_with("rtpmap:")
        || rest.starts_with("fmtp:")
        || rest.starts_with("rtcp:")
        || rest.starts_with("rtcp-fb:")
        || rest.starts_with("extmap:")
        || rest.starts_with("ssrc:")
        || rest.starts_with("ssrc-group:")
        || rest.starts_with("msid:")
}

fn apply_media_attribute(section: &mut MediaSection, attr: &str) {
    if let Some(mid) = attr.strip_prefix("mid:") {
        section.mid = mid.trim().to_string();
    } else if let Some(direction) = Direction::from_attr(attr) {
        section.direction = direction;
    } else if let Some(rest) = attr.strip_prefix("rtpmap:") {
        if let Some((pt, encoding)) = rest.split_once(' ') {
            if let Ok(pt) = pt.parse() {
                section.payloads_push_unique(pt);
                section.rtp.insert(pt, encoding.to_string());
            }
        }
    } else if let Some(rest) = attr.strip_prefix("fmtp:") {
        if let Some((pt, params)) = rest.split_once(' ') {
            if let Ok(pt) = pt.parse() {
                section.fmtp.insert(pt, params.to_string());
            }
        }
    } else if let Some(rest) = attr.strip_prefix("rtcp-fb:") {
        if let Some((pt, fb)) = rest.split_once(' ') {
            if let Ok(pt) = pt.parse() {
                section.rtcp_fb.entry(pt).or_default().push(fb.to_string());
            }
        }
    } else if let Some(rest) = attr.strip_prefix("rtcp:") {
        section.rtcp = Some(rest.to_string());
    } else if let Some(rest) = attr.strip_prefix("extmap:") {
        section.ext.push(rest.to_string());
    } else if let Some(rest) = attr.strip_prefix("ssrc-group:") {
        let mut parts = rest.split_whitespace();
        if let Some(semantics) = parts.next() {
            let ssrcs = parts.filter_map(|p| p.parse().ok()).collect();
            section.ssrc_groups.push(SsrcGroup {
                semantics: semantics.to_string(),
                ssrcs,
            });
        }
    } else if let Some(rest) = attr.strip_prefix("ssrc:") {
        let mut parts = rest.splitn(2, ' ');
        if let (Some(id), Some(kv)) = (parts.next(), parts.next()) {
            if let Ok(id) = id.parse() {
                let (attribute, value) = kv.split_once(':').unwrap_or((kv, ""));
                if attribute == "msid" {
                    section.msid = Some(value.to_string());
                }
                section.ssrcs.push(SsrcEntry {
                    id,
                    attribute: attribute.to_string(),
                    value: value.to_string(),
                });
            }
        }
    } else {
        section.other_attributes.push(format!("a={attr}"));
    }
}

impl MediaSection {
    fn payloads_push_unique(&mut self, pt: u8) {
        if !self.payloads.contains(&pt) {
            self.payloads.push(pt);
        }
    }
}

fn write_media_attributes(out: &mut String, section: &MediaSection) {
    out.push_str(&format!("a=mid:{}\r\n", section.mid));
    out.push_str(&format!("a={}\r\n", section.direction.as_attr()));
    for pt in &section.payloads {
        if let Some(encoding) = section.rtp.get(pt) {
            out.push_str(&format!("a=rtpmap:{pt} {encoding}\r\n"));
        }
        if let Some(fmtp) = section.fmtp.get(pt) {
            out.push_str(&format!("a=fmtp:{pt} {fmtp}\r\n"));
        }
        if let Some(fbs) = section.rtcp_fb.get(pt) {
            for fb in fbs {
                out.push_str(&format!("a=rtcp-fb:{pt} {fb}\r\n"));
            }
        }
    }
    if let Some(rtcp) = &section.rtcp {
        out.push_str(&format!("a=rtcp:{rtcp}\r\n"));
    }
    for ext in &section.ext {
        out.push_str(&format!("a=extmap:{ext}\r\n"));
    }
    for group in &section.ssrc_groups {
        out.push_str(&format!(
            "a=ssrc-group:{} {}\r\n",
            group.semantics,
            group
                .ssrcs
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        ));
    }
    for ssrc in &section.ssrcs {
        out.push_str(&format!(
            "a=ssrc:{} {}:{}\r\n",
            ssrc.id, ssrc.attribute, ssrc.value
        ));
    }
    for other in &section.other_attributes {
        out.push_str(other);
        out.push_str("\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=msid-semantic: WMS stream\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtcp-fb:111 transport-cc\r\n\
a=ssrc:1111 cname:abc\r\n\
a=ssrc:1111 msid:stream track\r\n\
a=fingerprint:sha-256 AA:BB\r\n";

    #[test]
    fn parses_mid_direction_and_payloads() {
        let parsed = ParsedSdp::parse(SAMPLE_OFFER);
        assert_eq!(parsed.media.len(), 1);
        let section = &parsed.media[0];
        assert_eq!(section.mid, "0");
        assert_eq!(section.kind, MediaKind::Audio);
        assert_eq!(section.direction, Direction::Sendrecv);
        assert_eq!(section.payloads, vec![111]);
        assert_eq!(section.rtp.get(&111).unwrap(), "opus/48000/2");
        assert_eq!(section.msid.as_deref(), Some("stream track"));
        assert_eq!(parsed.msid_semantic.as_deref(), Some("WMS stream"));
    }

    #[test]
    fn ssrc_entries_preserve_order_and_values() {
        let parsed = ParsedSdp::parse(SAMPLE_OFFER);
        let ssrcs = &parsed.media[0].ssrcs;
        assert_eq!(ssrcs.len(), 2);
        assert_eq!(ssrcs[0].attribute, "cname");
        assert_eq!(ssrcs[1].attribute, "msid");
    }

    #[test]
    fn apply_to_preserves_fingerprint_line() {
        let parsed = ParsedSdp::parse(SAMPLE_OFFER);
        let rewritten = parsed.apply_to(SAMPLE_OFFER);
        assert!(rewritten.contains("a=fingerprint:sha-256 AA:BB"));
        assert!(rewritten.contains("a=mid:0"));
    }

    #[test]
    fn non_application_excludes_data_channel_section() {
        let sdp = format!(
            "{SAMPLE_OFFER}m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:1\r\n"
        );
        let parsed = ParsedSdp::parse(&sdp);
        assert_eq!(parsed.media.len(), 2);
        assert_eq!(parsed.non_application().count(), 1);
        assert!(parsed.has_application_section());
    }
}
