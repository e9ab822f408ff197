use crate::sdp::candidate::Candidate;
use crate::sdp::sdp_type::{SdpType, SetupRole};
use log::warn;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;

/// A non-data media section, kept at its m-line index.
///
/// Attribute lines that the parser does not recognize are retained
/// verbatim so codec-specific parameters survive a parse and re-emission.
#[derive(Debug, Clone)]
pub struct Media {
    media_type: String,
    description: String,
    mid: String,
    attributes: Vec<String>,
}

impl Media {
    /// Builds a section from an `m=` line with the prefix removed:
    /// `<type> <port> <description>`.
    fn from_mline(mline: &str) -> Self {
        let mut parts = mline.splitn(3, ' ');
        let media_type = parts.next().unwrap_or_default().to_string();
        let _port = parts.next();
        let description = parts.next().unwrap_or_default().to_string();
        Self {
            media_type,
            description,
            mid: String::new(),
            attributes: Vec::new(),
        }
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }
}

#[derive(Debug, Clone)]
struct DataParameters {
    mid: String,
    sctp_port: Option<u16>,
    max_message_size: Option<usize>,
}

/// A session description used to negotiate a peer session.
///
/// Holds the session-level parameters (setup role, ICE credentials,
/// certificate fingerprint), the data-channel section, media sections
/// ordered by m-line index, and trickle ICE candidates. Descriptions are
/// built by parsing an SDP string or incrementally through the setters;
/// candidates may be appended until end-of-candidates is signalled.
#[derive(Debug, Clone)]
pub struct Description {
    sdp_type: SdpType,
    role: SetupRole,
    session_id: String,
    ice_ufrag: Option<String>,
    ice_pwd: Option<String>,
    fingerprint: Option<String>,
    data: DataParameters,
    media: BTreeMap<usize, Media>,
    candidates: Vec<Candidate>,
    ended: bool,
}

impl Description {
    /// An empty description with a fresh random session id.
    pub fn new(sdp_type: SdpType, role: SetupRole) -> Self {
        let mut description = Self {
            sdp_type: SdpType::Unspecified,
            role,
            session_id: rand::rng().random::<u32>().to_string(),
            ice_ufrag: None,
            ice_pwd: None,
            fingerprint: None,
            data: DataParameters {
                mid: "data".to_string(),
                sctp_port: None,
                max_message_size: None,
            },
            media: BTreeMap::new(),
            candidates: Vec::new(),
            ended: false,
        };
        description.hint_type(sdp_type);
        description
    }

    /// Parses an SDP string. Lines end with `\n` or `\r\n` and trailing
    /// whitespace is ignored. Malformed attribute values are logged and
    /// skipped, never fatal.
    pub fn parse(sdp: &str, sdp_type: SdpType) -> Self {
        let mut description = Self::new(sdp_type, SetupRole::ActPass);
        let mut current: Option<Media> = None;
        let mut mline_index = 0usize;

        for raw_line in sdp.lines() {
            let line = raw_line.trim_end();
            if let Some(mline) = line.strip_prefix("m=") {
                if let Some(media) = current.take() {
                    description.finish_media_section(media, &mut mline_index);
                }
                current = Some(Media::from_mline(mline));
            } else if let Some(attr) = line.strip_prefix("a=") {
                description.parse_attribute(attr, &mut current);
            }
        }
        if let Some(media) = current.take() {
            description.finish_media_section(media, &mut mline_index);
        }

        description
    }

    pub fn sdp_type(&self) -> SdpType {
        self.sdp_type
    }

    pub fn type_string(&self) -> String {
        self.sdp_type.to_string()
    }

    pub fn role(&self) -> SetupRole {
        self.role
    }

    pub fn role_string(&self) -> String {
        self.role.to_string()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn ice_ufrag(&self) -> Option<&str> {
        self.ice_ufrag.as_deref()
    }

    pub fn ice_pwd(&self) -> Option<&str> {
        self.ice_pwd.as_deref()
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn data_mid(&self) -> &str {
        &self.data.mid
    }

    /// Mid of the first media section, or the data mid when the
    /// description carries no media.
    pub fn bundle_mid(&self) -> &str {
        match self.media.get(&0) {
            Some(media) => &media.mid,
            None => &self.data.mid,
        }
    }

    pub fn sctp_port(&self) -> Option<u16> {
        self.data.sctp_port
    }

    pub fn max_message_size(&self) -> Option<usize> {
        self.data.max_message_size
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    /// Media sections in m-line index order.
    pub fn media(&self) -> impl Iterator<Item = &Media> {
        self.media.values()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Resolves an unspecified type. Has no effect once the type is known.
    /// `actpass` is illegal for an answer, so hinting an answer coerces a
    /// still-undecided role to passive.
    pub fn hint_type(&mut self, sdp_type: SdpType) {
        if self.sdp_type == SdpType::Unspecified {
            self.sdp_type = sdp_type;
            if self.sdp_type == SdpType::Answer && self.role == SetupRole::ActPass {
                self.role = SetupRole::Passive;
            }
        }
    }

    pub fn set_data_mid(&mut self, mid: String) {
        self.data.mid = mid;
    }

    /// Stores the certificate fingerprint, normalized to uppercase hex.
    pub fn set_fingerprint(&mut self, fingerprint: String) {
        self.fingerprint = Some(fingerprint.to_uppercase());
    }

    pub fn set_ice_ufrag(&mut self, ufrag: String) {
        self.ice_ufrag = Some(ufrag);
    }

    pub fn set_ice_pwd(&mut self, pwd: String) {
        self.ice_pwd = Some(pwd);
    }

    pub fn set_sctp_port(&mut self, port: u16) {
        self.data.sctp_port = Some(port);
    }

    pub fn set_max_message_size(&mut self, size: usize) {
        self.data.max_message_size = Some(size);
    }

    /// Appends a trickle candidate. Candidates may be added until
    /// end-of-candidates is signalled.
    pub fn add_candidate(&mut self, candidate: Candidate) {
        self.candidates.push(candidate);
    }

    pub fn end_candidates(&mut self) {
        self.ended = true;
    }

    /// Drains the candidate list and resets the end-of-candidates flag.
    pub fn extract_candidates(&mut self) -> Vec<Candidate> {
        self.ended = false;
        std::mem::take(&mut self.candidates)
    }

    /// Merges the media sections of another description. Existing indices
    /// are kept.
    pub fn add_media(&mut self, source: &Description) {
        for (index, media) in &source.media {
            self.media.entry(*index).or_insert_with(|| media.clone());
        }
    }

    /// Emits the description with the given end-of-line sequence.
    pub fn generate_sdp(&self, eol: &str) -> String {
        let mut sdp = String::new();

        // Header
        sdp.push_str(&format!("v=0{eol}"));
        sdp.push_str(&format!("o=- {} 0 IN IP4 127.0.0.1{eol}", self.session_id));
        sdp.push_str(&format!("s=-{eol}"));
        sdp.push_str(&format!("t=0 0{eol}"));

        // Bundle group, walking every m-line index. The data section takes
        // the index not occupied by a media section.
        sdp.push_str("a=group:BUNDLE");
        for index in 0..=self.media.len() {
            match self.media.get(&index) {
                Some(media) => sdp.push_str(&format!(" {}", media.mid)),
                None => sdp.push_str(&format!(" {}", self.data.mid)),
            }
        }
        sdp.push_str(eol);

        // Lip-sync group for the non-data media
        if !self.media.is_empty() {
            sdp.push_str("a=group:LS");
            for media in self.media.values() {
                sdp.push_str(&format!(" {}", media.mid));
            }
            sdp.push_str(eol);
        }

        // Session-level attributes
        sdp.push_str(&format!("a=msid-semantic:WMS *{eol}"));
        sdp.push_str(&format!("a=setup:{}{eol}", self.role));
        sdp.push_str(&format!(
            "a=ice-ufrag:{}{eol}",
            self.ice_ufrag.as_deref().unwrap_or_default()
        ));
        sdp.push_str(&format!(
            "a=ice-pwd:{}{eol}",
            self.ice_pwd.as_deref().unwrap_or_default()
        ));

        if !self.ended {
            sdp.push_str(&format!("a=ice-options:trickle{eol}"));
        }
        if let Some(fingerprint) = &self.fingerprint {
            sdp.push_str(&format!("a=fingerprint:sha-256 {fingerprint}{eol}"));
        }

        // Media sections in m-line index order
        for index in 0..=self.media.len() {
            if let Some(media) = self.media.get(&index) {
                sdp.push_str(&format!(
                    "m={} 0 {}{eol}",
                    media.media_type, media.description
                ));
                sdp.push_str(&format!("c=IN IP4 0.0.0.0{eol}"));
                sdp.push_str(&format!("a=bundle-only{eol}"));
                sdp.push_str(&format!("a=mid:{}{eol}", media.mid));
                for attribute in &media.attributes {
                    sdp.push_str(&format!("a={attribute}{eol}"));
                }
            } else {
                let port = if self.media.is_empty() { 9 } else { 0 };
                sdp.push_str(&format!(
                    "m=application {port} UDP/DTLS/SCTP webrtc-datachannel{eol}"
                ));
                sdp.push_str(&format!("c=IN IP4 0.0.0.0{eol}"));
                if !self.media.is_empty() {
                    sdp.push_str(&format!("a=bundle-only{eol}"));
                }
                sdp.push_str(&format!("a=mid:{}{eol}", self.data.mid));
                sdp.push_str(&format!("a=sendrecv{eol}"));
                if let Some(port) = self.data.sctp_port {
                    sdp.push_str(&format!("a=sctp-port:{port}{eol}"));
                }
                if let Some(size) = self.data.max_message_size {
                    sdp.push_str(&format!("a=max-message-size:{size}{eol}"));
                }
            }
        }

        // Candidates in insertion order
        for candidate in &self.candidates {
            sdp.push_str(&format!("{candidate}{eol}"));
        }
        if self.ended {
            sdp.push_str(&format!("a=end-of-candidates{eol}"));
        }

        sdp
    }

    /// Emits only the data section, for exchanges that negotiate no media.
    pub fn generate_data_sdp(&self, eol: &str) -> String {
        let mut sdp = String::new();

        // Header
        sdp.push_str(&format!("v=0{eol}"));
        sdp.push_str(&format!("o=- {} 0 IN IP4 127.0.0.1{eol}", self.session_id));
        sdp.push_str(&format!("s=-{eol}"));
        sdp.push_str(&format!("t=0 0{eol}"));

        // Data section
        sdp.push_str(&format!(
            "m=application 9 UDP/DTLS/SCTP webrtc-datachannel{eol}"
        ));
        sdp.push_str(&format!("c=IN IP4 0.0.0.0{eol}"));
        sdp.push_str(&format!("a=mid:{}{eol}", self.data.mid));
        sdp.push_str(&format!("a=sendrecv{eol}"));
        if let Some(port) = self.data.sctp_port {
            sdp.push_str(&format!("a=sctp-port:{port}{eol}"));
        }
        if let Some(size) = self.data.max_message_size {
            sdp.push_str(&format!("a=max-message-size:{size}{eol}"));
        }

        sdp.push_str(&format!("a=setup:{}{eol}", self.role));
        sdp.push_str(&format!(
            "a=ice-ufrag:{}{eol}",
            self.ice_ufrag.as_deref().unwrap_or_default()
        ));
        sdp.push_str(&format!(
            "a=ice-pwd:{}{eol}",
            self.ice_pwd.as_deref().unwrap_or_default()
        ));

        if !self.ended {
            sdp.push_str(&format!("a=ice-options:trickle{eol}"));
        }
        if let Some(fingerprint) = &self.fingerprint {
            sdp.push_str(&format!("a=fingerprint:sha-256 {fingerprint}{eol}"));
        }

        for candidate in &self.candidates {
            sdp.push_str(&format!("{candidate}{eol}"));
        }
        if self.ended {
            sdp.push_str(&format!("a=end-of-candidates{eol}"));
        }

        sdp
    }

    /// Closes the media section under construction. An `application`
    /// section contributes its mid to the data section instead of becoming
    /// a media entry. A section with no mid is dropped when it negotiates
    /// `ICE/SDP`, and otherwise retained under a mid synthesized from its
    /// m-line index.
    fn finish_media_section(&mut self, mut media: Media, index: &mut usize) {
        if media.mid.is_empty() {
            if media.description.contains("ICE/SDP") {
                warn!("sdp media line has no corresponding mid, ignoring");
                return;
            }
            media.mid = index.to_string();
            warn!(
                "sdp media line has no corresponding mid, using \"{}\"",
                media.mid
            );
        }
        if media.media_type == "application" {
            self.data.mid = media.mid;
        } else {
            self.media.insert(*index, media);
        }
        *index += 1;
    }

    fn parse_attribute(&mut self, attr: &str, current: &mut Option<Media>) {
        let (key, value) = match attr.split_once(':') {
            Some((key, value)) => (key, value),
            None => (attr, ""),
        };

        match key {
            "mid" => {
                if let Some(media) = current {
                    media.mid = value.to_string();
                }
            }
            "setup" => self.role = SetupRole::from(value),
            "fingerprint" => match value.strip_prefix("sha-256 ") {
                Some(fingerprint) => self.fingerprint = Some(fingerprint.to_uppercase()),
                None => warn!("unknown sdp fingerprint type: {}", value),
            },
            "ice-ufrag" => self.ice_ufrag = Some(value.to_string()),
            "ice-pwd" => self.ice_pwd = Some(value.to_string()),
            "sctp-port" => match value.parse::<u16>() {
                Ok(port) => self.data.sctp_port = Some(port),
                Err(_) => warn!("invalid sctp-port value: {}", value),
            },
            "max-message-size" => match value.parse::<usize>() {
                Ok(size) => self.data.max_message_size = Some(size),
                Err(_) => warn!("invalid max-message-size value: {}", value),
            },
            "candidate" => {
                let mid = current
                    .as_ref()
                    .map(|media| media.mid.as_str())
                    .filter(|mid| !mid.is_empty())
                    .unwrap_or(self.data.mid.as_str());
                self.candidates.push(Candidate::new(attr, mid));
            }
            "end-of-candidates" => self.ended = true,
            _ => {
                if let Some(media) = current {
                    media.attributes.push(attr.to_string());
                }
            }
        }
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.generate_sdp("\r\n"))
    }
}
