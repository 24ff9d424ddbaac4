//! Wire-shaped data types shared by the MockRTC engine and whatever admin
//! transport sits in front of it.
//!
//! Nothing in this crate touches a socket or an ICE stack -- that's
//! `mockrtc-core`. This crate only owns the shapes that would actually be
//! serialized to a control client: session descriptions, step/matcher
//! definitions, and the event taxonomy.

pub mod error;
pub mod events;
pub mod matchers;
pub mod sdp;
pub mod steps;

pub use error::{MockRtcError, Result};
pub use events::{ConnectionMetadata, Event, EventPayload, MessageDirection, TimingEvents};
pub use matchers::{MatcherDefinition, Rule};
pub use sdp::{
    Candidate, CandidateType, Direction, MediaKind, MediaSection, ParsedSdp, SdpType,
    SessionDescription, SsrcEntry, SsrcGroup, TransportProtocol,
};
pub use steps::{validate_step_list, AnswerResolverToken, MessageData, StepDefinition};
