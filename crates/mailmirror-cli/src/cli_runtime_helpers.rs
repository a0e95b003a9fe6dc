use anyhow::Result;
use mailmirror_core::{MessageTree, StoredMessage, classify_subject};
use mailmirror_source::FetchReport;
use serde_json::{Value as JsonValue, json};

use super::CLI_SCHEMA_VERSION;

pub(crate) fn output_ok(value: JsonValue) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": true,
            "result": value
        }))?
    );
    Ok(())
}

pub(crate) fn output_error(message: &str) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": false,
            "error": message
        }))?
    );
    Ok(())
}

pub(crate) fn report_to_json(report: &FetchReport) -> JsonValue {
    let failures: Vec<JsonValue> = report
        .failures
        .iter()
        .map(|failure| {
            json!({
                "seq": failure.seq,
                "message_id": failure.message_id,
                "error": failure.error.to_string(),
            })
        })
        .collect();
    json!({
        "stored": report.stored,
        "skipped": report.skipped,
        "failed": report.failed(),
        "failures": failures,
    })
}

pub(crate) fn summary_to_json(message: &StoredMessage) -> JsonValue {
    json!({
        "message_id": message.message_id,
        "subject": message.subject,
        "date": message.date().to_rfc3339(),
        "in_reply_to": message.in_reply_to,
        "size": message.size,
        "patch": classify_subject(&message.subject),
    })
}

/// Flattens a tree in display order. `line` is the subject indented two
/// spaces per reply level.
pub(crate) fn tree_to_json(tree: &MessageTree) -> JsonValue {
    let messages: Vec<JsonValue> = tree
        .walk()
        .into_iter()
        .map(|(depth, message)| {
            let mut entry = summary_to_json(message);
            entry["depth"] = json!(depth);
            entry["line"] = json!(format!("{}{}", "  ".repeat(depth), message.subject));
            entry
        })
        .collect();
    json!({
        "root": tree.message.message_id,
        "message_count": tree.message_count(),
        "messages": messages,
    })
}
