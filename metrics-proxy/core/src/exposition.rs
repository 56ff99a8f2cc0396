//! Prometheus text-exposition parsing and namespace filtering.
//!
//! Raw exporter payloads cannot be scoped at query time, so the proxy
//! parses the scraped text, drops every sample whose `namespace` label is
//! not in the caller's set, and re-serializes. Families keep their
//! HELP/TYPE header even when all of their samples are filtered away.

use crate::{error::Error, namespace::NamespaceSet};

/// One metric family: a name, optional HELP/TYPE metadata, and its samples
/// in input order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: Option<String>,
    pub kind: Option<String>,
    pub samples: Vec<Sample>,
}

/// One sample line.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub name: String,
    /// Label pairs in input order; names are unique within a sample.
    pub labels: Vec<(String, String)>,
    pub value: f64,
    /// Millisecond timestamp, when the exporter supplied one.
    pub timestamp: Option<i64>,
}

/// Filters and re-serializes a raw exposition payload in one step.
pub fn filter_text(text: &str, namespaces: &NamespaceSet) -> Result<String, Error> {
    let mut families = parse(text)?;
    filter(&mut families, namespaces);
    Ok(serialize(&families))
}

/// Drops every sample whose `namespace` label value is not a member of
/// `namespaces`. A sample with no `namespace` label at all is dropped:
/// absence is not membership.
pub fn filter(families: &mut [MetricFamily], namespaces: &NamespaceSet) {
    for family in families {
        family.samples.retain(|sample| {
            sample
                .label("namespace")
                .map(|value| namespaces.contains(value))
                .unwrap_or(false)
        });
    }
}

/// Parses the text exposition format into metric families.
pub fn parse(text: &str) -> Result<Vec<MetricFamily>, Error> {
    let mut families: Vec<MetricFamily> = Vec::new();

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.trim().is_empty() {
            continue;
        }

        let malformed =
            |msg: &str| Error::UpstreamMalformed(format!("line {}: {}", lineno + 1, msg));

        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim_start();
            if let Some(rest) = comment.strip_prefix("HELP ") {
                let (name, help) = rest
                    .split_once(char::is_whitespace)
                    .unwrap_or((rest.trim_end(), ""));
                family_for(&mut families, name).help = Some(unescape_help(help));
            } else if let Some(rest) = comment.strip_prefix("TYPE ") {
                let (name, kind) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| malformed("TYPE line without a type"))?;
                family_for(&mut families, name).kind = Some(kind.trim().to_string());
            }
            // Any other comment is skipped.
            continue;
        }

        let sample = parse_sample(line).map_err(|msg| malformed(&msg))?;
        let attach = matches!(families.last(), Some(f) if belongs_to(&f.name, &sample.name));
        if attach {
            let family = families.last_mut().expect("family was just matched");
            family.samples.push(sample);
        } else {
            families.push(MetricFamily {
                name: sample.name.clone(),
                help: None,
                kind: None,
                samples: vec![sample],
            });
        }
    }

    Ok(families)
}

/// Re-emits families in the text exposition format, preserving input order.
pub fn serialize(families: &[MetricFamily]) -> String {
    let mut out = String::new();
    for family in families {
        if let Some(help) = &family.help {
            out.push_str("# HELP ");
            out.push_str(&family.name);
            out.push(' ');
            out.push_str(&escape_help(help));
            out.push('\n');
        }
        if let Some(kind) = &family.kind {
            out.push_str("# TYPE ");
            out.push_str(&family.name);
            out.push(' ');
            out.push_str(kind);
            out.push('\n');
        }
        for sample in &family.samples {
            out.push_str(&sample.name);
            if !sample.labels.is_empty() {
                out.push('{');
                for (i, (name, value)) in sample.labels.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&escape_label_value(value));
                    out.push('"');
                }
                out.push('}');
            }
            out.push(' ');
            out.push_str(&format_value(sample.value));
            if let Some(ts) = sample.timestamp {
                out.push(' ');
                out.push_str(&ts.to_string());
            }
            out.push('\n');
        }
    }
    out
}

// === impl Sample ===

impl Sample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Returns the family that HELP/TYPE metadata for `name` applies to,
/// creating it at the tail when the metadata precedes its samples.
fn family_for<'f>(families: &'f mut Vec<MetricFamily>, name: &str) -> &'f mut MetricFamily {
    let at_tail = matches!(families.last(), Some(f) if f.name == name);
    if !at_tail {
        families.push(MetricFamily {
            name: name.to_string(),
            ..Default::default()
        });
    }
    families.last_mut().expect("family was just ensured")
}

/// A sample named `sample` belongs to family `family` when it is the family
/// name itself or a histogram/summary series of it.
fn belongs_to(family: &str, sample: &str) -> bool {
    match sample.strip_prefix(family) {
        Some(rest) => matches!(rest, "" | "_bucket" | "_sum" | "_count"),
        None => false,
    }
}

fn parse_sample(line: &str) -> Result<Sample, String> {
    let (name, rest) = split_metric_name(line);
    if name.is_empty() {
        return Err(format!("expected a metric name, found {line:?}"));
    }

    let rest = rest.trim_start();
    let (labels, rest) = if rest.starts_with('{') {
        parse_label_block(rest)?
    } else {
        (Vec::new(), rest)
    };

    let mut fields = rest.split_whitespace();
    let value = fields
        .next()
        .ok_or_else(|| "missing sample value".to_string())?;
    let value = parse_value(value).ok_or_else(|| format!("invalid sample value {value:?}"))?;
    let timestamp = fields
        .next()
        .map(|ts| {
            ts.parse::<i64>()
                .map_err(|_| format!("invalid timestamp {ts:?}"))
        })
        .transpose()?;
    if fields.next().is_some() {
        return Err(format!("trailing data after sample: {line:?}"));
    }

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
        timestamp,
    })
}

/// Parses a `{name="value",...}` block, returning the pairs and the text
/// after the closing brace.
fn parse_label_block(s: &str) -> Result<(Vec<(String, String)>, &str), String> {
    let mut labels = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 1; // past '{'

    loop {
        while bytes.get(i) == Some(&b' ') {
            i += 1;
        }
        match bytes.get(i) {
            Some(b'}') => return Ok((labels, &s[i + 1..])),
            Some(_) => {}
            None => return Err("unterminated label block".to_string()),
        }

        let start = i;
        while matches!(bytes.get(i), Some(c) if c.is_ascii_alphanumeric() || *c == b'_') {
            i += 1;
        }
        if i == start {
            return Err(format!("invalid label name at {:?}", &s[i..]));
        }
        let name = &s[start..i];

        while bytes.get(i) == Some(&b' ') {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            return Err(format!("expected '=' after label {name:?}"));
        }
        i += 1;
        while bytes.get(i) == Some(&b' ') {
            i += 1;
        }
        if bytes.get(i) != Some(&b'"') {
            return Err(format!("expected quoted value for label {name:?}"));
        }
        i += 1;

        let mut value = String::new();
        loop {
            match bytes.get(i) {
                Some(b'"') => {
                    i += 1;
                    break;
                }
                Some(b'\\') => {
                    match bytes.get(i + 1) {
                        Some(b'\\') => value.push('\\'),
                        Some(b'"') => value.push('"'),
                        Some(b'n') => value.push('\n'),
                        other => {
                            return Err(format!("invalid escape in label {name:?}: {other:?}"))
                        }
                    }
                    i += 2;
                }
                Some(_) => {
                    // Values are UTF-8; copy whole characters, not bytes.
                    let c = s[i..].chars().next().expect("index is on a char boundary");
                    value.push(c);
                    i += c.len_utf8();
                }
                None => return Err(format!("unterminated value for label {name:?}")),
            }
        }
        labels.push((name.to_string(), value));

        while bytes.get(i) == Some(&b' ') {
            i += 1;
        }
        match bytes.get(i) {
            Some(b',') => i += 1,
            Some(b'}') => return Ok((labels, &s[i + 1..])),
            _ => return Err("expected ',' or '}' in label block".to_string()),
        }
    }
}

fn split_metric_name(line: &str) -> (&str, &str) {
    let mut end = 0;
    for (i, c) in line.char_indices() {
        let valid = match c {
            'a'..='z' | 'A'..='Z' | '_' | ':' => true,
            '0'..='9' => i > 0,
            _ => false,
        };
        if !valid {
            break;
        }
        end = i + c.len_utf8();
    }
    line.split_at(end)
}

fn parse_value(s: &str) -> Option<f64> {
    match s {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        s => s.parse().ok(),
    }
}

fn format_value(v: f64) -> String {
    if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else if v.is_nan() {
        "NaN".to_string()
    } else {
        v.to_string()
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape_help(help: &str) -> String {
    let mut out = String::with_capacity(help.len());
    let mut chars = help.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = "\
# HELP http_requests_total Total HTTP requests.
# TYPE http_requests_total counter
http_requests_total{namespace=\"team-a\",code=\"200\"} 1027 1395066363000
http_requests_total{namespace=\"team-b\",code=\"200\"} 3
http_requests_total{code=\"500\"} 7
# HELP process_start_time_seconds Start time of the process.
# TYPE process_start_time_seconds gauge
process_start_time_seconds 1.58e9
# TYPE request_duration_seconds histogram
request_duration_seconds_bucket{namespace=\"team-a\",le=\"0.1\"} 5
request_duration_seconds_bucket{namespace=\"team-a\",le=\"+Inf\"} 9
request_duration_seconds_sum{namespace=\"team-a\"} 0.87
request_duration_seconds_count{namespace=\"team-a\"} 9
";

    fn team_a() -> NamespaceSet {
        ["team-a"].into_iter().collect()
    }

    #[test]
    fn parses_families_and_samples() {
        let families = parse(PAYLOAD).unwrap();
        assert_eq!(families.len(), 3);

        assert_eq!(families[0].name, "http_requests_total");
        assert_eq!(
            families[0].help.as_deref(),
            Some("Total HTTP requests.")
        );
        assert_eq!(families[0].kind.as_deref(), Some("counter"));
        assert_eq!(families[0].samples.len(), 3);
        assert_eq!(families[0].samples[0].timestamp, Some(1395066363000));

        assert_eq!(families[1].samples[0].value, 1.58e9);

        assert_eq!(families[2].name, "request_duration_seconds");
        assert_eq!(families[2].samples.len(), 4);
        assert_eq!(families[2].samples[1].value, f64::INFINITY);
    }

    #[test]
    fn filter_keeps_only_authorized_samples() {
        let filtered = filter_text(PAYLOAD, &team_a()).unwrap();
        let families = parse(&filtered).unwrap();

        for family in &families {
            for sample in &family.samples {
                assert_eq!(sample.label("namespace"), Some("team-a"));
            }
        }
        assert_eq!(families[0].samples.len(), 1);
        assert_eq!(families[2].samples.len(), 4);
    }

    #[test]
    fn samples_without_namespace_are_dropped() {
        let filtered = filter_text(PAYLOAD, &team_a()).unwrap();
        assert!(!filtered.contains("process_start_time_seconds 1"));
        assert!(!filtered.contains("code=\"500\""));
    }

    #[test]
    fn empty_families_keep_their_header() {
        let filtered = filter_text(PAYLOAD, &team_a()).unwrap();
        assert!(filtered.contains("# HELP process_start_time_seconds"));
        assert!(filtered.contains("# TYPE process_start_time_seconds gauge"));
    }

    #[test]
    fn filtering_is_idempotent() {
        let once = filter_text(PAYLOAD, &team_a()).unwrap();
        let twice = filter_text(&once, &team_a()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn label_escapes_round_trip() {
        let payload =
            "weird{namespace=\"team-a\",msg=\"a\\\\b \\\"c\\\" \\nd\"} 1\n";
        let families = parse(payload).unwrap();
        assert_eq!(
            families[0].samples[0].label("msg"),
            Some("a\\b \"c\" \nd")
        );
        assert_eq!(serialize(&families), payload);
    }

    #[test]
    fn unknown_comments_are_skipped() {
        let families = parse("# just a comment\nup{namespace=\"a\"} 1\n").unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].samples.len(), 1);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        for payload in [
            "up{namespace=\"a\" 1\n",
            "up{namespace=a} 1\n",
            "up 1 2 3\n",
            "up{} notanumber\n",
            "{namespace=\"a\"} 1\n",
        ] {
            assert!(parse(payload).is_err(), "{payload:?}");
        }
    }

    #[test]
    fn special_values_round_trip() {
        let payload = "m{namespace=\"a\"} +Inf\nm{namespace=\"b\"} -Inf\nm{namespace=\"c\"} NaN\n";
        let families = parse(payload).unwrap();
        assert_eq!(serialize(&families), payload);
    }
}
