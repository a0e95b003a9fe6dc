use std::fmt;

use mailparse::{MailAddr, MailHeader, SingleInfo, addrparse, addrparse_header};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Canonical (personal-name, mailbox-name, host-name) triple.
///
/// A missing display name is the empty string, never `None`, so that the
/// store's uniqueness constraint applies to the whole triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub personal: String,
    pub mailbox: String,
    pub host: String,
}

impl Address {
    pub fn new(personal: &str, mailbox: &str, host: &str) -> Self {
        Self {
            personal: personal.to_string(),
            mailbox: mailbox.to_string(),
            host: host.to_string(),
        }
    }

    pub fn from_single(info: &SingleInfo) -> Result<Self, StoreError> {
        let addr = info.addr.trim();
        // The host is everything after the last '@'.
        let (mailbox, host) = addr
            .rsplit_once('@')
            .ok_or_else(|| StoreError::parse(format!("badly formed email address: {}", addr)))?;
        Ok(Self {
            personal: info
                .display_name
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
            mailbox: mailbox.to_string(),
            host: host.to_string(),
        })
    }

    /// Parses a free-form address list such as a `To:` header value.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, StoreError> {
        flatten(&addrparse(raw)?)
    }

    /// `mailbox@host`, as used in mbox separator lines.
    pub fn mbox_sender(&self) -> String {
        format!("{}@{}", self.mailbox, self.host)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.personal.is_empty() {
            write!(f, "{}@{}", self.mailbox, self.host)
        } else {
            write!(f, "{} <{}@{}>", self.personal, self.mailbox, self.host)
        }
    }
}

/// Normalizes every address in an address-list header. Groups are flattened
/// to their members.
pub fn normalize_address_header(header: &MailHeader) -> Result<Vec<Address>, StoreError> {
    flatten(&addrparse_header(header)?)
}

fn flatten(addrs: &[MailAddr]) -> Result<Vec<Address>, StoreError> {
    let mut out = Vec::new();
    for addr in addrs {
        match addr {
            MailAddr::Single(info) => out.push(Address::from_single(info)?),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push(Address::from_single(info)?);
                }
            }
        }
    }
    Ok(out)
}

/// Role an address plays in a message envelope. The discriminant is the
/// value persisted in `envelope_links.role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeRole {
    From = 1,
    Sender = 2,
    ReplyTo = 3,
    To = 4,
    Cc = 5,
    Bcc = 6,
}

impl EnvelopeRole {
    pub const ALL: [EnvelopeRole; 6] = [
        EnvelopeRole::From,
        EnvelopeRole::Sender,
        EnvelopeRole::ReplyTo,
        EnvelopeRole::To,
        EnvelopeRole::Cc,
        EnvelopeRole::Bcc,
    ];

    pub fn header_name(self) -> &'static str {
        match self {
            EnvelopeRole::From => "From",
            EnvelopeRole::Sender => "Sender",
            EnvelopeRole::ReplyTo => "Reply-To",
            EnvelopeRole::To => "To",
            EnvelopeRole::Cc => "Cc",
            EnvelopeRole::Bcc => "Bcc",
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.as_i64() == value)
    }
}

#[cfg(test)]
mod tests {
    use super::{Address, EnvelopeRole};

    #[test]
    fn bare_address_has_empty_personal_name() {
        let parsed = Address::parse_list("foo@bar.com").unwrap();
        assert_eq!(parsed, vec![Address::new("", "foo", "bar.com")]);
    }

    #[test]
    fn display_name_and_last_at_sign_split() {
        let parsed = Address::parse_list("\"Jane Q. Doe\" <jane@lists.example.org>").unwrap();
        assert_eq!(
            parsed,
            vec![Address::new("Jane Q. Doe", "jane", "lists.example.org")]
        );
        assert_eq!(parsed[0].mbox_sender(), "jane@lists.example.org");
        assert_eq!(parsed[0].to_string(), "Jane Q. Doe <jane@lists.example.org>");
    }

    #[test]
    fn groups_are_flattened() {
        let parsed = Address::parse_list("team: a@x.org, b@y.org;, c@z.org").unwrap();
        let mailboxes: Vec<&str> = parsed.iter().map(|a| a.mailbox.as_str()).collect();
        assert_eq!(mailboxes, vec!["a", "b", "c"]);
    }

    #[test]
    fn address_without_host_is_a_parse_error() {
        let err = Address::parse_list("undisclosed-recipients").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn role_round_trips_through_persisted_value() {
        for role in EnvelopeRole::ALL {
            assert_eq!(EnvelopeRole::from_i64(role.as_i64()), Some(role));
        }
        assert_eq!(EnvelopeRole::from_i64(0), None);
    }
}
