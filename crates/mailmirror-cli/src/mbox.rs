use std::io::{self, Write};

use mailmirror_core::{Address, ExportEntry};

const UNKNOWN_SENDER: &str = "MAILER-DAEMON";

/// Writes `entries` as an mboxo stream that `git am` can split.
///
/// Body lines starting with `From ` are escaped to `>From `; line endings are
/// normalized to LF.
pub(crate) fn write_mbox<W: Write>(out: &mut W, entries: &[ExportEntry]) -> io::Result<()> {
    for entry in entries {
        let sender = entry
            .from
            .as_ref()
            .map(Address::mbox_sender)
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        writeln!(
            out,
            "From {} {}",
            sender,
            entry.date.format("%a %b %e %H:%M:%S %Y")
        )?;
        let raw = entry.raw.strip_suffix(b"\n").unwrap_or(&entry.raw[..]);
        for line in raw.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.starts_with(b"From ") {
                out.write_all(b">")?;
            }
            out.write_all(line)?;
            out.write_all(b"\n")?;
        }
        out.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use mailmirror_core::{Address, ExportEntry};

    use super::write_mbox;

    fn entry(id: &str, from: Option<Address>, raw: &str) -> anyhow::Result<ExportEntry> {
        Ok(ExportEntry {
            message_id: id.to_string(),
            from,
            date: Utc
                .with_ymd_and_hms(2023, 8, 2, 9, 5, 0)
                .single()
                .ok_or_else(|| anyhow::anyhow!("bad date"))?,
            raw: raw.as_bytes().to_vec(),
        })
    }

    #[test]
    fn writes_separators_and_escapes_from_lines() -> anyhow::Result<()> {
        let entries = vec![
            entry(
                "<p1@x>",
                Some(Address::new("Alice", "alice", "example.org")),
                "Subject: [PATCH 1/2] one\r\n\r\nFrom here on\r\n>From stays\r\n",
            )?,
            entry("<p2@x>", None, "Subject: [PATCH 2/2] two\n\nbody")?,
        ];
        let mut out = Vec::new();
        write_mbox(&mut out, &entries)?;
        let text = String::from_utf8(out)?;

        let expected = "From alice@example.org Wed Aug  2 09:05:00 2023\n\
Subject: [PATCH 1/2] one\n\
\n\
>From here on\n\
>From stays\n\
\n\
From MAILER-DAEMON Wed Aug  2 09:05:00 2023\n\
Subject: [PATCH 2/2] two\n\
\n\
body\n\
\n";
        assert_eq!(text, expected);
        Ok(())
    }

    #[test]
    fn empty_series_writes_nothing() -> anyhow::Result<()> {
        let mut out = Vec::new();
        write_mbox(&mut out, &[])?;
        assert!(out.is_empty());
        Ok(())
    }
}
