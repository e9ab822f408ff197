use std::fmt;

/// A trickle ICE candidate tied to a media identifier.
///
/// The candidate string is stored without the `a=` and `candidate:`
/// prefixes; display renders the full attribute line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    candidate: String,
    mid: String,
}

impl Candidate {
    pub fn new(candidate: &str, mid: &str) -> Self {
        let mut raw = candidate;
        for prefix in ["a=", "candidate:"] {
            if let Some(rest) = raw.strip_prefix(prefix) {
                raw = rest;
            }
        }
        Self {
            candidate: raw.to_string(),
            mid: mid.to_string(),
        }
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a=candidate:{}", self.candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_are_stripped() {
        let tests = vec![
            "1 1 UDP 2122317823 192.168.1.2 49153 typ host",
            "candidate:1 1 UDP 2122317823 192.168.1.2 49153 typ host",
            "a=candidate:1 1 UDP 2122317823 192.168.1.2 49153 typ host",
        ];

        for raw in tests {
            let candidate = Candidate::new(raw, "data");
            assert_eq!(
                candidate.candidate(),
                "1 1 UDP 2122317823 192.168.1.2 49153 typ host"
            );
            assert_eq!(candidate.mid(), "data");
        }
    }

    #[test]
    fn test_display_renders_attribute_line() {
        let candidate = Candidate::new("candidate:0 1 UDP 1 10.0.0.1 40000 typ host", "0");
        assert_eq!(
            candidate.to_string(),
            "a=candidate:0 1 UDP 1 10.0.0.1 40000 typ host"
        );
    }
}
