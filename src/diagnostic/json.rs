use super::{locate, Diagnostic, Severity};

/// One JSON object per diagnostic (NDJSON when several are emitted), so
/// non-interactive callers can parse stderr line by line.
pub fn render(d: &Diagnostic) -> String {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };

    let labels: Vec<serde_json::Value> = d
        .labels
        .iter()
        .map(|l| {
            let mut obj = serde_json::json!({
                "start": l.span.start,
                "end": l.span.end,
                "message": l.message,
                "primary": l.is_primary,
            });
            if let Some(src) = d.source.as_deref() {
                let (line, col, _) = locate(src, l.span.start);
                obj["line"] = serde_json::Value::from(line);
                obj["col"] = serde_json::Value::from(col);
            }
            obj
        })
        .collect();

    let mut obj = serde_json::json!({
        "severity": severity,
        "message": d.message,
        "labels": labels,
        "notes": d.notes,
    });

    if let Some(code) = d.code {
        obj["code"] = serde_json::Value::String(code.to_string());
    }
    if let Some(s) = &d.suggestion {
        obj["suggestion"] = serde_json::Value::String(s.clone());
    }

    serde_json::to_string(&obj).unwrap_or_else(|_| {
        r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Span;

    fn parse(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn basic_error() {
        let v = parse(&render(&Diagnostic::error("Division by zero")));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "Division by zero");
        assert!(v["labels"].as_array().unwrap().is_empty());
    }

    #[test]
    fn code_key_present_when_set() {
        let v = parse(&render(
            &Diagnostic::error("boom").with_code("TPV-R002"),
        ));
        assert_eq!(v["code"], "TPV-R002");
    }

    #[test]
    fn label_with_source_gets_line_and_col() {
        let d = Diagnostic::error("bad token")
            .with_span(Span { start: 4, end: 6 }, "here")
            .with_source("HLT\nXX".to_string());
        let v = parse(&render(&d));
        let label = &v["labels"][0];
        assert_eq!(label["start"], 4);
        assert_eq!(label["end"], 6);
        assert_eq!(label["line"], 2);
        assert_eq!(label["col"], 1);
        assert_eq!(label["primary"], true);
    }

    #[test]
    fn label_without_source_has_no_line() {
        let d = Diagnostic::error("bad").with_span(Span { start: 1, end: 2 }, "here");
        let v = parse(&render(&d));
        assert!(v["labels"][0].get("line").is_none());
    }

    #[test]
    fn notes_and_suggestion_serialize() {
        let d = Diagnostic::error("bad")
            .with_note("execution stopped")
            .with_suggestion("fix it");
        let v = parse(&render(&d));
        assert_eq!(v["notes"][0], "execution stopped");
        assert_eq!(v["suggestion"], "fix it");
    }

    #[test]
    fn output_is_one_line() {
        let d = Diagnostic::error("multi\nline message").with_code("TPV-L001");
        let out = render(&d);
        assert_eq!(out.lines().count(), 1);
    }
}
