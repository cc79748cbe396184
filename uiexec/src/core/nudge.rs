//! Bounded "correct and retry once" combinator for format failures.

use std::fmt;

/// Both failures from [`retry_once_with_nudge`], plus the untouched payload.
#[derive(Debug)]
pub struct NudgeFailure<E> {
    /// Error from the first attempt on the raw payload.
    pub first: E,
    /// Error from the corrected payload; `None` when no correction applied.
    pub retry: Option<E>,
    /// Original payload for diagnosis.
    pub raw: String,
}

impl<E: fmt::Display> fmt::Display for NudgeFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.retry {
            Some(retry) => write!(f, "{} (after correction: {})", self.first, retry),
            None => write!(f, "{}", self.first),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for NudgeFailure<E> {}

/// Run `op` on `raw`; on failure apply `nudge` once and run `op` on the
/// corrected payload. Never retries more than once.
///
/// `nudge` returns `None` when it has no correction to offer, which fails
/// immediately with the first error.
pub fn retry_once_with_nudge<T, E>(
    raw: &str,
    op: impl Fn(&str) -> Result<T, E>,
    nudge: impl FnOnce(&str) -> Option<String>,
) -> Result<T, NudgeFailure<E>> {
    let first = match op(raw) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    let Some(corrected) = nudge(raw) else {
        return Err(NudgeFailure {
            first,
            retry: None,
            raw: raw.to_string(),
        });
    };
    op(&corrected).map_err(|retry| NudgeFailure {
        first,
        retry: Some(retry),
        raw: raw.to_string(),
    })
}

/// Pull a JSON object out of prose or a fenced code block.
///
/// Returns the span from the first `{` to the last `}`, preferring the body of
/// a ```` ```json ```` fence when one exists. `None` if the text has no object
/// or is already exactly that span.
pub fn extract_json_object(text: &str) -> Option<String> {
    let body = fenced_body(text).unwrap_or(text);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &body[start..=end];
    if candidate == text.trim() {
        return None;
    }
    Some(candidate.to_string())
}

fn fenced_body(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}
