//! Parsing of subscription search criteria.

use thiserror::Error;

/// Query parameters the poller sets itself. Caller values are dropped.
pub const POLLER_OWNED_PARAMETERS: [&str; 3] = ["_count", "_elements", "_sort"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("search criteria {input:?} are not a valid query string: {reason}")]
pub struct CriteriaError {
    pub input: String,
    pub reason: String,
}

/// Parses criteria like `?status=final&code=1234` into ordered, decoded
/// `(name, value)` pairs.
///
/// The leading `?` is optional. Blank input or a bare `?` yields no pairs.
/// A parameter without `=` gets an empty value; `+` decodes to a space.
pub fn parse_criteria(criteria: Option<&str>) -> Result<Vec<(String, String)>, CriteriaError> {
    let Some(raw) = criteria.map(str::trim) else {
        return Ok(Vec::new());
    };
    let query = raw.strip_prefix('?').unwrap_or(raw);

    let mut pairs = Vec::new();
    for part in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = part.split_once('=').unwrap_or((part, ""));
        let name = decode(name, raw)?;
        if name.is_empty() || POLLER_OWNED_PARAMETERS.contains(&name.as_str()) {
            continue;
        }
        pairs.push((name, decode(value, raw)?));
    }
    Ok(pairs)
}

fn decode(component: &str, input: &str) -> Result<String, CriteriaError> {
    let spaced = component.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|e| CriteriaError {
            input: input.to_string(),
            reason: e.to_string(),
        })
}
