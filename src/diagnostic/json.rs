use serde_json::{Value, json};

use super::Diagnostic;
use crate::ast::SourceMap;

/// One diagnostic per line, for editors and test harnesses.
pub fn render(d: &Diagnostic) -> String {
    let map = d.source.as_deref().map(SourceMap::new);

    let labels: Vec<Value> = d
        .labels
        .iter()
        .map(|l| {
            let mut obj = json!({
                "start": l.span.start,
                "end": l.span.end,
                "message": l.message,
            });
            if let Some(map) = &map {
                let (line, col) = map.lookup(l.span.start);
                obj["line"] = Value::from(line);
                obj["col"] = Value::from(col);
            }
            obj
        })
        .collect();

    let mut obj = json!({
        "severity": "error",
        "message": d.message,
        "labels": labels,
        "notes": d.notes,
    });
    if let Some(code) = d.code {
        obj["code"] = Value::from(code);
    }
    if let Some(file) = &d.file {
        obj["file"] = Value::from(file.as_str());
    }
    if let Some(pos) = d.position {
        obj["line"] = Value::from(pos.line);
        obj["col"] = Value::from(pos.column);
    }
    if let Some(s) = &d.suggestion {
        obj["suggestion"] = Value::from(s.as_str());
    }
    obj.to_string()
}
