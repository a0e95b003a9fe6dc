use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, dateparse, parse_headers};
use serde::{Deserialize, Serialize};

use crate::{Address, EnvelopeRole, StoreError, normalize_address_header};

/// A message row as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub subject: String,
    pub date_ts: i64,
    pub in_reply_to: Option<String>,
    pub size: i64,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl StoredMessage {
    pub fn date(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.date_ts, 0).unwrap_or_default()
    }
}

/// Header fields extracted from a raw message before it is stored.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message_id: String,
    pub subject: String,
    pub date_ts: i64,
    pub in_reply_to: Option<String>,
    pub envelope: Vec<(EnvelopeRole, Vec<Address>)>,
}

pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage, StoreError> {
    let (headers, _) = parse_headers(raw)?;

    let message_id = headers
        .get_first_value("Message-ID")
        .and_then(|v| normalize_message_id(&v))
        .ok_or_else(|| StoreError::parse("missing Message-ID header"))?;
    let date = headers
        .get_first_value("Date")
        .ok_or_else(|| StoreError::parse("missing Date header"))?;
    let date_ts = dateparse(date.trim())
        .map_err(|e| StoreError::parse(format!("parsing message date {:?}: {}", date, e)))?;
    let subject = headers
        .get_first_value("Subject")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let in_reply_to = headers
        .get_first_value("In-Reply-To")
        .and_then(|v| first_message_id(&v));

    let mut envelope = Vec::new();
    for role in EnvelopeRole::ALL {
        let mut addrs = Vec::new();
        for header in headers.get_all_headers(role.header_name()) {
            let parsed = normalize_address_header(header).map_err(|e| {
                StoreError::parse(format!("address list for {}: {}", role.header_name(), e))
            })?;
            addrs.extend(parsed);
        }
        if !addrs.is_empty() {
            envelope.push((role, addrs));
        }
    }

    Ok(ParsedMessage {
        message_id,
        subject,
        date_ts,
        in_reply_to,
        envelope,
    })
}

pub fn normalize_message_id(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// First `<...>` token of a reference header, or the first bare word when no
/// angle brackets are present.
pub fn first_message_id(value: &str) -> Option<String> {
    if let Some(start) = value.find('<') {
        if let Some(len) = value[start..].find('>') {
            return Some(value[start..start + len + 1].to_string());
        }
    }
    value.split_whitespace().next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::{first_message_id, parse_message};
    use crate::{Address, EnvelopeRole};

    #[test]
    fn extracts_envelope_fields() {
        let raw = b"Message-ID: <b@example.org>\r\n\
From: Alice <alice@example.org>\r\n\
To: bob@example.org, carol@example.net\r\n\
Cc: Dave <dave@example.com>\r\n\
Subject: Re: lunch\r\n\
Date: Tue, 1 Aug 2023 10:00:00 +0000\r\n\
In-Reply-To: <a@example.org> (Bob's message)\r\n\
\r\n\
sounds good\r\n";
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.message_id, "<b@example.org>");
        assert_eq!(parsed.subject, "Re: lunch");
        assert_eq!(parsed.date_ts, 1_690_884_000);
        assert_eq!(parsed.in_reply_to.as_deref(), Some("<a@example.org>"));

        let roles: Vec<EnvelopeRole> = parsed.envelope.iter().map(|(r, _)| *r).collect();
        assert_eq!(
            roles,
            vec![EnvelopeRole::From, EnvelopeRole::To, EnvelopeRole::Cc]
        );
        assert_eq!(
            parsed.envelope[0].1,
            vec![Address::new("Alice", "alice", "example.org")]
        );
        assert_eq!(parsed.envelope[1].1.len(), 2);
    }

    #[test]
    fn missing_message_id_is_a_parse_error() {
        let raw = b"Subject: hi\r\nDate: Tue, 1 Aug 2023 10:00:00 +0000\r\n\r\nbody\r\n";
        assert!(parse_message(raw).unwrap_err().is_parse());
    }

    #[test]
    fn missing_date_is_a_parse_error() {
        let raw = b"Message-ID: <x@y>\r\nSubject: undated\r\n\r\nbody\r\n";
        assert!(parse_message(raw).unwrap_err().is_parse());
    }

    #[test]
    fn first_message_id_prefers_bracketed_token() {
        assert_eq!(
            first_message_id("<one@x> <two@x>").as_deref(),
            Some("<one@x>")
        );
        assert_eq!(first_message_id("  bare@x  ").as_deref(), Some("bare@x"));
        assert_eq!(first_message_id("   "), None);
    }
}
