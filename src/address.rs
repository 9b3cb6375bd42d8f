//! Exit addresses: where a message leaves the mix network and how.

use crate::descriptor::Capability;
use crate::prelude::*;

pub const DROP_TYPE: u16 = 0x0000;
pub const SMTP_TYPE: u16 = 0x0100;
pub const MBOX_TYPE: u16 = 0x0101;
pub const TEST_TYPE: u16 = 0xFFFE;

// Deliberately stricter than RFC 2822: the local part is printable ascii,
// the domain is dotted labels.
static MAILBOX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[!-?A-~]+@[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .unwrap()
});

pub fn is_smtp_mailbox(s: &str) -> bool {
    MAILBOX_RE.is_match(s)
}

fn is_mbox_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic() && c != '@')
}

/// The target of a message: the exit type for the final hop, the routing
/// info it carries, and (optionally) a server that must be the last hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    exit_type: u16,
    exit_info: Vec<u8>,
    last_hop: Option<String>,
}

impl Address {
    pub fn new(exit_type: u16, exit_info: &[u8], last_hop: Option<&str>) -> Address {
        Address {
            exit_type,
            exit_info: exit_info.to_vec(),
            last_hop: last_hop.map(str::to_owned),
        }
    }

    pub fn exit_type(&self) -> u16 {
        self.exit_type
    }

    pub fn exit_info(&self) -> &[u8] {
        &self.exit_info
    }

    pub fn last_hop(&self) -> Option<&str> {
        self.last_hop.as_deref()
    }

    /// The capability the exit hop must advertise, if any.
    pub fn exit_capability(&self) -> Option<Capability> {
        match self.exit_type {
            MBOX_TYPE => Some(Capability::Mbox),
            SMTP_TYPE => Some(Capability::Smtp),
            _ => None,
        }
    }
}

fn bad(s: &str, why: &str) -> eyre::Report {
    MixError::BadAddress(format!("{:?}: {}", s, why)).into()
}

impl FromStr for Address {
    type Err = eyre::Report;

    /// Accepts:
    ///     mbox:<mailboxname>@<server>
    ///  OR mbox:<mailboxname>
    ///  OR smtp:<email address>
    ///  OR <email address>   (smtp is implicit)
    ///  OR drop
    ///  OR test
    ///  OR 0x<routing type>:<routing info>
    fn from_str(s: &str) -> Result<Address> {
        if s.eq_ignore_ascii_case("drop") {
            return Ok(Address::new(DROP_TYPE, b"", None));
        }
        if s.eq_ignore_ascii_case("test") {
            return Ok(Address::new(TEST_TYPE, b"", None));
        }
        let (tp, val) = match s.split_once(':') {
            None => {
                if is_smtp_mailbox(s) {
                    return Ok(Address::new(SMTP_TYPE, s.as_bytes(), None));
                }
                return Err(bad(s, "not a mailbox"));
            }
            Some(parts) => parts,
        };
        let tp = tp.to_ascii_lowercase();
        if let Some(hex) = tp.strip_prefix("0x") {
            if hex.len() != 4 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(bad(s, "routing type must be 4 hex digits"));
            }
            // length was checked, so this can't overflow or fail
            let exit_type = u16::from_str_radix(hex, 16)
                .map_err(|e| bad(s, &e.to_string()))?;
            // Well-known types get the same validation as their keyword
            // forms, so every parsed address formats to text that parses
            // back to the same value.
            match exit_type {
                DROP_TYPE if !val.is_empty() => {
                    return Err(bad(s, "drop addresses carry no routing info"))
                }
                SMTP_TYPE if !is_smtp_mailbox(val) => {
                    return Err(bad(s, "not a mailbox"))
                }
                MBOX_TYPE if !is_mbox_name(val) => {
                    return Err(bad(s, "bad mailbox name"))
                }
                _ => {}
            }
            return Ok(Address::new(exit_type, val.as_bytes(), None));
        }
        match tp.as_str() {
            "mbox" => {
                let (mbox, server) = match val.split_once('@') {
                    Some((m, srv)) => (m, Some(srv)),
                    None => (val, None),
                };
                if !is_mbox_name(mbox) {
                    return Err(bad(s, "bad mailbox name"));
                }
                if server == Some("") {
                    return Err(bad(s, "empty server name"));
                }
                Ok(Address::new(MBOX_TYPE, mbox.as_bytes(), server))
            }
            "smtp" => {
                if !is_smtp_mailbox(val) {
                    return Err(bad(s, "not a mailbox"));
                }
                Ok(Address::new(SMTP_TYPE, val.as_bytes(), None))
            }
            "test" => Ok(Address::new(TEST_TYPE, val.as_bytes(), None)),
            _ => Err(bad(s, "unrecognized address type")),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = String::from_utf8_lossy(&self.exit_info);
        match self.exit_type {
            DROP_TYPE => write!(f, "drop"),
            TEST_TYPE if self.exit_info.is_empty() => write!(f, "test"),
            TEST_TYPE => write!(f, "test:{}", info),
            // the explicit prefix keeps mailboxes with a ':' in the local
            // part reparseable
            SMTP_TYPE => write!(f, "smtp:{}", info),
            MBOX_TYPE => match &self.last_hop {
                Some(server) => write!(f, "mbox:{}@{}", info, server),
                None => write!(f, "mbox:{}", info),
            },
            other => write!(f, "0x{:04X}:{}", other, info),
        }
    }
}
