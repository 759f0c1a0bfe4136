//! WhatsApp JID (Jabber ID) types.
//!
//! JIDs identify users, groups, and other entities. A [`DeviceAddress`] names
//! one logical endpoint of a user and keys every pairwise session.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Known JID servers on WhatsApp
pub mod servers {
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    pub const GROUP: &str = "g.us";
    pub const BROADCAST: &str = "broadcast";
    pub const HIDDEN_USER: &str = "lid";
    pub const HOSTED: &str = "hosted";
    pub const HOSTED_LID: &str = "hosted.lid";
}

/// Domain type constants used by the AD-JID wire form.
pub const WHATSAPP_DOMAIN: u8 = 0;
pub const LID_DOMAIN: u8 = 1;
pub const HOSTED_DOMAIN: u8 = 128;
pub const HOSTED_LID_DOMAIN: u8 = 129;

/// A WhatsApp JID.
///
/// Plain JIDs are user/server pairs; AD-JIDs additionally carry an agent and
/// a device number and address one device of a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Jid {
    pub user: String,
    pub agent: u8,
    pub device: u16,
    pub server: String,
}

impl Jid {
    /// Creates a new regular JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    /// Creates an AD-JID from its wire form (domain type + device).
    pub fn new_ad(user: impl Into<String>, domain: u8, device: u8) -> Self {
        let (server, agent) = match domain {
            LID_DOMAIN => (servers::HIDDEN_USER, 0),
            HOSTED_DOMAIN => (servers::HOSTED, 0),
            HOSTED_LID_DOMAIN => (servers::HOSTED_LID, 0),
            _ => (servers::DEFAULT_USER, domain),
        };
        Self {
            user: user.into(),
            agent,
            device: device as u16,
            server: server.to_string(),
        }
    }

    /// Domain type written in the AD-JID wire form.
    pub fn domain(&self) -> u8 {
        match self.server.as_str() {
            servers::HIDDEN_USER => LID_DOMAIN,
            servers::HOSTED => HOSTED_DOMAIN,
            servers::HOSTED_LID => HOSTED_LID_DOMAIN,
            _ => self.agent,
        }
    }

    /// Whether this JID needs the AD wire form to survive a round trip.
    pub fn is_ad(&self) -> bool {
        self.agent > 0 || self.device > 0
    }

    /// Whether the AD wire form can carry this JID losslessly. On the
    /// default server the agent travels as the domain byte, so agents equal
    /// to another server's domain do not fit.
    pub fn fits_ad_form(&self) -> bool {
        self.device <= u8::MAX as u16
            && match self.server.as_str() {
                servers::DEFAULT_USER => !matches!(self.agent, LID_DOMAIN | HOSTED_DOMAIN | HOSTED_LID_DOMAIN),
                servers::HIDDEN_USER | servers::HOSTED | servers::HOSTED_LID => self.agent == 0,
                _ => false,
            }
    }

    /// Whether a JID token (pair or AD form) can carry this JID; otherwise
    /// it travels as its text form.
    pub fn has_binary_form(&self) -> bool {
        !self.is_ad() || self.fits_ad_form()
    }

    /// Returns a version of the JID without agent and device.
    pub fn to_non_ad(&self) -> Self {
        Self::new(self.user.clone(), self.server.clone())
    }

    pub fn is_group(&self) -> bool {
        self.server == servers::GROUP
    }

    /// Returns true if the JID is empty (no server).
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    /// Returns the signal address user string.
    pub fn signal_address_user(&self) -> String {
        match self.domain() {
            0 => self.user.clone(),
            agent => format!("{}_{}", self.user, agent),
        }
    }

    /// Address of the device this JID points at.
    pub fn device_address(&self) -> DeviceAddress {
        DeviceAddress::new(self.signal_address_user(), self.device)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.agent > 0 {
            write!(f, "{}.{}:{}@{}", self.user, self.agent, self.device, self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

/// Error type for JID parsing
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("failed to parse JID: {0}")]
pub struct ParseJidError(pub String);

impl FromStr for Jid {
    type Err = ParseJidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((user_part, server)) = s.split_once('@') else {
            return Ok(Jid::new("", s));
        };
        if server.contains('@') {
            return Err(ParseJidError("unexpected number of @ in JID".to_string()));
        }

        let mut jid = Jid::new(user_part, server);
        let user = match user_part.split_once(':') {
            Some((user, device)) => {
                jid.device = device
                    .parse()
                    .map_err(|_| ParseJidError("failed to parse device from JID".to_string()))?;
                user
            }
            None => user_part,
        };

        match user.split_once('.') {
            Some((name, agent)) if !agent.is_empty() && agent.bytes().all(|b| b.is_ascii_digit()) => {
                jid.user = name.to_string();
                jid.agent = agent
                    .parse()
                    .map_err(|_| ParseJidError("failed to parse agent from JID".to_string()))?;
            }
            _ => jid.user = user.to_string(),
        }
        Ok(jid)
    }
}

/// One logical endpoint of a user; the key of every pairwise session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub user: String,
    pub device: u16,
}

impl DeviceAddress {
    pub fn new(user: impl Into<String>, device: u16) -> Self {
        Self {
            user: user.into(),
            device,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user, self.device)
    }
}

lazy_static::lazy_static! {
    pub static ref SERVER_JID: Jid = Jid::new("", servers::DEFAULT_USER);
    pub static ref GROUP_SERVER_JID: Jid = Jid::new("", servers::GROUP);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_jid() {
        let jid: Jid = "1234567890@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.server, servers::DEFAULT_USER);
        assert_eq!(jid.device, 0);
        assert_eq!(jid.agent, 0);
    }

    #[test]
    fn test_parse_device_jid() {
        let jid: Jid = "1234567890:2@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.device, 2);
        assert_eq!(jid.to_string(), "1234567890:2@s.whatsapp.net");
    }

    #[test]
    fn test_parse_agent_jid() {
        let jid: Jid = "1234567890.1:3@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.agent, 1);
        assert_eq!(jid.device, 3);
        assert_eq!(jid.to_string(), "1234567890.1:3@s.whatsapp.net");
    }

    #[test]
    fn test_group_jid() {
        let jid: Jid = "123456789-1234567890@g.us".parse().unwrap();
        assert!(jid.is_group());
        assert_eq!(jid.user, "123456789-1234567890");
    }

    #[test]
    fn test_server_only_jid() {
        let jid: Jid = "s.whatsapp.net".parse().unwrap();
        assert_eq!(jid, *SERVER_JID);
        assert_eq!(jid.to_string(), "s.whatsapp.net");
    }

    #[test]
    fn test_device_address() {
        let jid: Jid = "555:7@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.device_address(), DeviceAddress::new("555", 7));

        let lid = Jid::new_ad("999", LID_DOMAIN, 2);
        assert_eq!(lid.server, servers::HIDDEN_USER);
        assert_eq!(lid.device_address().to_string(), "999_1.2");
    }

    #[test]
    fn test_high_device_numbers_stay_distinct() {
        let low: Jid = "555:1@s.whatsapp.net".parse().unwrap();
        let high: Jid = "555:257@s.whatsapp.net".parse().unwrap();
        assert_eq!(high.device_address().device, 257);
        assert_ne!(low.device_address(), high.device_address());
        assert!(!high.fits_ad_form());
    }

    #[test]
    fn test_agents_matching_a_domain_do_not_fit_ad_form() {
        for agent in [LID_DOMAIN, HOSTED_DOMAIN, HOSTED_LID_DOMAIN] {
            let jid = Jid {
                user: "123".into(),
                agent,
                device: 0,
                server: servers::DEFAULT_USER.into(),
            };
            assert!(!jid.has_binary_form());
        }
        let mut jid = Jid::new("123", servers::DEFAULT_USER);
        jid.agent = 2;
        assert!(jid.has_binary_form());
        assert!(!"123-456:3@g.us".parse::<Jid>().unwrap().has_binary_form());
    }
}
