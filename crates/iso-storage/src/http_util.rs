use iso_types::error::{IsoError, Result};

/// Extract and parse the `Content-Length` header from an HTTP response.
pub fn extract_content_length(resp: &ureq::Response, context: &str) -> Result<u64> {
    let header = resp.header("Content-Length").ok_or_else(|| {
        IsoError::Transport(format!("{context}: response missing Content-Length header"))
    })?;
    header.parse::<u64>().map_err(|_| {
        IsoError::Transport(format!("{context}: invalid Content-Length header: {header}"))
    })
}

/// A parsed `Content-Range: bytes {start}-{end}/{total}` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server answered `*`.
    pub total: Option<u64>,
}

pub fn parse_content_range(header: &str, context: &str) -> Result<ContentRange> {
    let malformed =
        || IsoError::Transport(format!("{context}: malformed Content-Range header: {header}"));
    let rest = header.trim().strip_prefix("bytes ").ok_or_else(malformed)?;
    let (range_part, total) = rest.split_once('/').ok_or_else(malformed)?;
    let (start_str, end_str) = range_part.split_once('-').ok_or_else(malformed)?;
    let start: u64 = start_str.parse().map_err(|_| malformed())?;
    let end: u64 = end_str.parse().map_err(|_| malformed())?;
    if end < start {
        return Err(IsoError::Transport(format!(
            "{context}: Content-Range end < start: {header}"
        )));
    }
    let total = match total {
        "*" => None,
        t => Some(t.parse::<u64>().map_err(|_| malformed())?),
    };
    Ok(ContentRange { start, end, total })
}
