//! Delivery channels.

use serde::{Deserialize, Serialize};

/// A delivery channel for billing notifications.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    /// Every channel, in a stable order.
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Push => "PUSH",
        }
    }

    /// Parse a channel name, ignoring case and surrounding whitespace.
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse().ok()
    }

    /// Channel used when this one exhausts its retry budget.
    pub fn fallback(&self) -> Channel {
        Channel::Sms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        assert_eq!(Channel::parse("EMAIL"), Some(Channel::Email));
        assert_eq!(Channel::parse(" sms "), Some(Channel::Sms));
        assert_eq!(Channel::parse("push"), Some(Channel::Push));
        assert_eq!(Channel::parse("FAX"), None);
    }

    #[test]
    fn test_channel_display_matches_wire_name() {
        for channel in Channel::ALL {
            assert_eq!(channel.to_string(), channel.as_str());
            let json = serde_json::to_string(&channel).unwrap();
            assert_eq!(json, format!("\"{}\"", channel.as_str()));
        }
    }
}
