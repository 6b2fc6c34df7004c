use crate::error::{HopperError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "hopper.yaml";
pub const DATABASE_FILE: &str = "hopper.db";
pub const MASTER_INBOX_DIR: &str = "master_inbox";
pub const CONTAINER_INBOXES_DIR: &str = "container_inboxes";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn topic_dir(master: &Path, topic: &str) -> PathBuf {
    master.join(topic)
}

pub fn entry_path(master: &Path, topic: &str, sequence: u64) -> PathBuf {
    topic_dir(master, topic).join(sequence.to_string())
}

pub fn destination_dir(containers: &Path, destination_id: &str) -> PathBuf {
    containers.join(destination_id)
}

/// Parse an inbox entry file name. Temp files and anything else that is not a
/// plain decimal sequence number yield `None`.
pub fn parse_sequence(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

// ---------------------------------------------------------------------------
// Component validation
// ---------------------------------------------------------------------------

static COMPONENT_RE: OnceLock<Regex> = OnceLock::new();

fn component_re() -> &'static Regex {
    COMPONENT_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$").unwrap())
}

fn is_component(value: &str) -> bool {
    !value.is_empty() && value.len() <= 128 && component_re().is_match(value)
}

pub fn validate_topic(topic: &str) -> Result<()> {
    if !is_component(topic) {
        return Err(HopperError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

pub fn validate_destination(destination_id: &str) -> Result<()> {
    if !is_component(destination_id) {
        return Err(HopperError::InvalidDestination(destination_id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_topics() {
        for topic in ["images", "T1", "sensor.raw", "a_b-c", "9lives"] {
            validate_topic(topic).unwrap_or_else(|_| panic!("expected valid: {topic}"));
        }
    }

    #[test]
    fn invalid_topics() {
        let long = "x".repeat(129);
        for topic in ["", ".", "..", "../etc", "a/b", "-dash", "has space", long.as_str()] {
            assert!(validate_topic(topic).is_err(), "expected invalid: {topic}");
        }
    }

    #[test]
    fn destination_accepts_uuid() {
        validate_destination("0b0e7c8c-3f5e-4d5c-9a53-0c4f3bb1f0e2").unwrap();
        assert!(matches!(
            validate_destination("../x"),
            Err(HopperError::InvalidDestination(_))
        ));
    }

    #[test]
    fn sequence_names() {
        assert_eq!(parse_sequence("42"), Some(42));
        assert_eq!(parse_sequence(".tmpA1b2"), None);
        assert_eq!(parse_sequence("+1"), None);
        assert_eq!(parse_sequence(""), None);
    }

    #[test]
    fn path_helpers() {
        let master = Path::new("/var/hopper/master_inbox");
        assert_eq!(
            entry_path(master, "T1", 7),
            PathBuf::from("/var/hopper/master_inbox/T1/7")
        );
        assert_eq!(
            destination_dir(Path::new("/var/hopper/container_inboxes"), "abc"),
            PathBuf::from("/var/hopper/container_inboxes/abc")
        );
    }
}
