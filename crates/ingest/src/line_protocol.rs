//! Line-protocol decoding.
//!
//! ```text
//! measurement[,tag=value...] field=value[,field=value...] [unix-nanos]
//! ```
//!
//! Field values: `1.5` float, `3i` integer, `"text"` string, `t`/`true`/`f`/`false`
//! boolean. Commas, spaces, and equals signs in names are escaped with a
//! backslash; string values escape `"` and `\`.

use chrono::{DateTime, TimeZone, Utc};
use engine_core::limits::MAX_LINE_BYTES;
use engine_core::{Error, FieldValue, Record, Result};

/// Decode a multi-line body. Blank lines and `#` comments are skipped.
///
/// Lines without a timestamp get `now`.
pub fn parse(body: &str, now: DateTime<Utc>) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for (idx, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let record = parse_line(line, now)
            .map_err(|e| Error::validation(format!("line {}: {}", idx + 1, e)))?;
        records.push(record);
    }
    Ok(records)
}

/// Decode a single line.
pub fn parse_line(line: &str, now: DateTime<Utc>) -> std::result::Result<Record, String> {
    if line.len() > MAX_LINE_BYTES {
        return Err(format!("line exceeds {} bytes", MAX_LINE_BYTES));
    }

    let sections = split_unescaped(line, ' ', true);
    let sections: Vec<&str> = sections.into_iter().filter(|s| !s.is_empty()).collect();
    let (key, fields, timestamp) = match sections.as_slice() {
        [key, fields] => (*key, *fields, None),
        [key, fields, ts] => (*key, *fields, Some(*ts)),
        _ => return Err("expected 'measurement[,tags] fields [timestamp]'".to_string()),
    };

    let mut key_parts = split_unescaped(key, ',', false).into_iter();
    let measurement = unescape(key_parts.next().unwrap_or_default());
    if measurement.is_empty() {
        return Err("missing measurement".to_string());
    }

    let timestamp = match timestamp {
        Some(ts) => {
            let nanos: i64 = ts
                .parse()
                .map_err(|_| format!("invalid timestamp '{}'", ts))?;
            Utc.timestamp_nanos(nanos)
        }
        None => now,
    };

    let mut record = Record::new(timestamp, measurement);

    for pair in key_parts {
        let (k, v) = split_pair(pair).ok_or_else(|| format!("invalid tag '{}'", pair))?;
        if v.is_empty() {
            return Err(format!("empty value for tag '{}'", k));
        }
        record.tags.insert(unescape(k), unescape(v));
    }

    for pair in split_unescaped(fields, ',', true) {
        let (k, v) = split_pair(pair).ok_or_else(|| format!("invalid field '{}'", pair))?;
        record.fields.insert(unescape(k), parse_value(v)?);
    }

    if record.fields.is_empty() {
        return Err("at least one field is required".to_string());
    }
    Ok(record)
}

fn parse_value(raw: &str) -> std::result::Result<FieldValue, String> {
    if let Some(inner) = raw.strip_prefix('"') {
        let inner = inner
            .strip_suffix('"')
            .ok_or_else(|| format!("unterminated string '{}'", raw))?;
        return Ok(FieldValue::Str(unescape(inner)));
    }

    match raw {
        "t" | "T" | "true" | "True" | "TRUE" => return Ok(FieldValue::Bool(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Ok(FieldValue::Bool(false)),
        _ => {}
    }

    if let Some(int) = raw.strip_suffix('i') {
        return int
            .parse::<i64>()
            .map(FieldValue::Int)
            .map_err(|_| format!("invalid integer '{}'", raw));
    }

    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(FieldValue::Float)
        .ok_or_else(|| format!("invalid field value '{}'", raw))
}

/// Split on `sep` where it is neither escaped nor (optionally) quoted.
fn split_unescaped(s: &str, sep: char, quotes: bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut in_quotes = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' if quotes => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Split `key=value` on the first unescaped `=`.
fn split_pair(s: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' if i > 0 => return Some((&s[..i], &s[i + 1..])),
            '=' => return None,
            _ => {}
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_full_line() {
        let r = parse_line(
            r#"ticks,symbol=AAPL,venue=XNAS price=187.25,size=300i,side="buy",halted=f 1700000000000000001"#,
            now(),
        )
        .unwrap();

        assert_eq!(r.measurement, "ticks");
        assert_eq!(r.tags["symbol"], "AAPL");
        assert_eq!(r.tags["venue"], "XNAS");
        assert_eq!(r.fields["price"], FieldValue::Float(187.25));
        assert_eq!(r.fields["size"], FieldValue::Int(300));
        assert_eq!(r.fields["side"], FieldValue::Str("buy".into()));
        assert_eq!(r.fields["halted"], FieldValue::Bool(false));
        assert_eq!(r.timestamp.timestamp_nanos_opt(), Some(1_700_000_000_000_000_001));
    }

    #[test]
    fn test_missing_timestamp_uses_now() {
        let r = parse_line("cpu value=1", now()).unwrap();
        assert_eq!(r.timestamp, now());
        assert!(r.tags.is_empty());
    }

    #[test]
    fn test_escapes_and_quoted_spaces() {
        let r = parse_line(
            r#"my\ metric,host=a\,b note="hello, \"world\" x=1",v=2 5"#,
            now(),
        )
        .unwrap();
        assert_eq!(r.measurement, "my metric");
        assert_eq!(r.tags["host"], "a,b");
        assert_eq!(r.fields["note"], FieldValue::Str(r#"hello, "world" x=1"#.into()));
        assert_eq!(r.fields["v"], FieldValue::Float(2.0));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_line("ticks", now()).is_err());
        assert!(parse_line("ticks price=abc", now()).is_err());
        assert!(parse_line("ticks price=1 notanumber", now()).is_err());
        assert!(parse_line("ticks,symbol price=1", now()).is_err());
        assert!(parse_line(r#"ticks s="open"#, now()).is_err());
        assert!(parse_line("ticks n=1.5i", now()).is_err());
    }

    #[test]
    fn test_body_reports_line_number() {
        let body = "# header\nticks price=1\n\nticks price=\n";
        let err = parse(body, now()).unwrap_err();
        assert!(err.to_string().contains("line 4"));

        let ok = parse("a v=1\nb v=2\n", now()).unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[1].measurement, "b");
    }
}
