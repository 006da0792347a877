//! Store key layout.
//!
//! Vendor-neutral logical paths, keyed by execution so that every write
//! is naturally convergent:
//!
//! ```text
//! inbox/<blueprintId>/<name>                                arriving documents
//! extraction-complete/<executionId>.json                    completion markers
//! extraction/<executionId>/tree.json                        raw extraction tree
//! extraction/<executionId>/pages.json                       page context refs
//! review-output/<executionId>/<reviewLoopId>/corrections.json
//! aggregated/<executionId>/result.json                      final result
//! ```

use uuid::Uuid;

/// Prefix watched for arriving documents. The next path segment is the
/// blueprint id, the rest the document name.
pub const INBOX_PREFIX: &str = "inbox";

/// Prefix watched for extraction completion markers.
pub const EXTRACTION_COMPLETE_PREFIX: &str = "extraction-complete";

/// Prefix watched for reviewer output.
pub const REVIEW_OUTPUT_PREFIX: &str = "review-output";

pub fn extraction_tree_key(execution_id: Uuid) -> String {
    format!("extraction/{execution_id}/tree.json")
}

pub fn extraction_pages_key(execution_id: Uuid) -> String {
    format!("extraction/{execution_id}/pages.json")
}

pub fn corrections_key(execution_id: Uuid, review_loop_id: &str) -> String {
    format!("{REVIEW_OUTPUT_PREFIX}/{execution_id}/{review_loop_id}/corrections.json")
}

pub fn aggregated_result_key(execution_id: Uuid) -> String {
    format!("aggregated/{execution_id}/result.json")
}

/// Parse `inbox/<blueprintId>/<name>` into `(blueprint_id, name)`.
/// The name may itself contain slashes.
pub fn parse_inbox_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix(INBOX_PREFIX)?.strip_prefix('/')?;
    let (blueprint_id, name) = rest.split_once('/')?;
    if blueprint_id.is_empty() || name.is_empty() {
        return None;
    }
    Some((blueprint_id.to_string(), name.to_string()))
}

/// Parse `extraction-complete/<executionId>.json`.
pub fn parse_extraction_complete_key(key: &str) -> Option<Uuid> {
    let rest = key
        .strip_prefix(EXTRACTION_COMPLETE_PREFIX)?
        .strip_prefix('/')?;
    rest.strip_suffix(".json")?.parse().ok()
}

/// Parse `review-output/<executionId>/<reviewLoopId>/corrections.json`
/// into `(execution_id, review_loop_id)`.
pub fn parse_corrections_key(key: &str) -> Option<(Uuid, String)> {
    let rest = key.strip_prefix(REVIEW_OUTPUT_PREFIX)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let execution_id: Uuid = parts.next()?.parse().ok()?;
    let review_loop_id = parts.next()?;
    if review_loop_id.is_empty() || parts.next()? != "corrections.json" {
        return None;
    }
    if parts.next().is_some() {
        return None;
    }
    Some((execution_id, review_loop_id.to_string()))
}
