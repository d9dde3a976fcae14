use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Rewrite an upstream image URL to go through the local `/img/` proxy, so
/// clients never hit the origin (which rejects hotlinked requests).
pub fn transform_url(url: &str) -> String {
    if url.is_empty() {
        return String::new();
    }
    format!("/img/{}", urlencoding::encode(url))
}

/// Escape the five XML-reserved characters for feed output.
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Parse the update timestamps the source prints on novel and volume pages.
/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD` and the same with a trailing `HH:MM`.
/// Returns unix seconds, or `None` when the string matches no known shape.
pub fn parse_update_date(text: &str) -> Option<i64> {
    let text = text.trim();
    for fmt in ["%Y-%m-%d %H:%M", "%Y/%m/%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&dt).timestamp());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            let dt = d.and_hms_opt(0, 0, 0)?;
            return Some(Utc.from_utc_datetime(&dt).timestamp());
        }
    }
    None
}

/// Current time as unix seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
