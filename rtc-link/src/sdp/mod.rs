//! Session description model used to negotiate a peer session.

mod candidate;
mod description;
mod sdp_type;

pub use candidate::Candidate;
pub use description::{Description, Media};
pub use sdp_type::{SdpType, SetupRole};
