use serde::{Deserialize, Serialize};
use std::fmt;

const SDP_TYPE_OFFER_STR: &str = "offer";
const SDP_TYPE_ANSWER_STR: &str = "answer";

/// Type of a session description in the offer/answer model.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum SdpType {
    /// Type not yet specified. Resolved by [`Description::hint_type`](crate::sdp::Description::hint_type).
    #[default]
    Unspecified,

    /// The description must be treated as an SDP offer.
    #[serde(rename = "offer")]
    Offer,

    /// The description must be treated as a final SDP answer.
    #[serde(rename = "answer")]
    Answer,
}

/// Creates an SdpType from a string.
impl From<&str> for SdpType {
    fn from(raw: &str) -> Self {
        match raw {
            SDP_TYPE_OFFER_STR => SdpType::Offer,
            SDP_TYPE_ANSWER_STR => SdpType::Answer,
            _ => SdpType::Unspecified,
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SdpType::Offer => write!(f, "{SDP_TYPE_OFFER_STR}"),
            SdpType::Answer => write!(f, "{SDP_TYPE_ANSWER_STR}"),
            SdpType::Unspecified => Ok(()),
        }
    }
}

const SETUP_ROLE_ACTIVE_STR: &str = "active";
const SETUP_ROLE_PASSIVE_STR: &str = "passive";
const SETUP_ROLE_ACTPASS_STR: &str = "actpass";

/// DTLS setup role carried by the `a=setup:` attribute.
///
/// `ActPass` is only legal in an offer; an answer hinting a description
/// still in `ActPass` is coerced to `Passive` (RFC 5763).
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum SetupRole {
    #[serde(rename = "active")]
    Active,

    #[serde(rename = "passive")]
    Passive,

    #[default]
    #[serde(rename = "actpass")]
    ActPass,
}

impl From<&str> for SetupRole {
    fn from(raw: &str) -> Self {
        match raw {
            SETUP_ROLE_ACTIVE_STR => SetupRole::Active,
            SETUP_ROLE_PASSIVE_STR => SetupRole::Passive,
            _ => SetupRole::ActPass,
        }
    }
}

impl fmt::Display for SetupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SetupRole::Active => write!(f, "{SETUP_ROLE_ACTIVE_STR}"),
            SetupRole::Passive => write!(f, "{SETUP_ROLE_PASSIVE_STR}"),
            SetupRole::ActPass => write!(f, "{SETUP_ROLE_ACTPASS_STR}"),
        }
    }
}
