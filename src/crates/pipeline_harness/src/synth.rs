//! Generation of the engine's input/output wiring for a set of streams.

use std::path::Path;

use serde_json::Value;

use crate::error::{HarnessError, HarnessResult};

/// Free-form field map attached to every event of a stream.
pub type FieldSet = serde_json::Map<String, Value>;

/// Prefix shared by every field and tag the harness injects.
pub const RESERVED_PREFIX: &str = "__lfv_";
/// Field stamped with the emission sequence number.
pub const SEQUENCE_FIELD: &str = "__lfv_id";
/// Metadata key identifying the stream an event came in on.
pub const STREAM_METADATA_KEY: &str = "__lfv_testcase";
/// Name of the generated filter file placed in the engine's config directory.
pub const SEQUENCE_FILTER_FILE: &str = "zz-lfv-sequence.conf";

/// Filter that numbers events in the order they leave the filter chain.
/// Only deterministic because the engine runs with a single worker.
pub const SEQUENCE_FILTER: &str = r#"filter {
  ruby {
    id => "__lfv_sequence"
    init => "@lfv_sequence = 0"
    code => "event.set('__lfv_id', @lfv_sequence); @lfv_sequence += 1"
  }
}
"#;

const METADATA_FIELD: &str = "@metadata";
const OUTPUT_CODEC: &str = "json_lines";

/// The bits of a stream channel the synthesizer needs.
#[derive(Debug, Clone, Copy)]
pub struct StreamWiring<'a> {
    pub socket_path: &'a Path,
    pub sink_path: &'a Path,
    pub codec: &'a str,
    pub fields: &'a FieldSet,
}

/// Generated input and output clauses, one of each per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedConfig {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl SynthesizedConfig {
    /// Text passed to the engine with `-e`.
    pub fn pipeline_text(&self) -> String {
        format!(
            "input {{ {} }} output {{ {} }}",
            self.inputs.join(" "),
            self.outputs.join(" ")
        )
    }
}

/// Tag identifying which stream an event was read from.
pub fn stream_tag(ordinal: usize) -> String {
    format!("{RESERVED_PREFIX}stream_{ordinal}")
}

/// Build the input and output clauses for every stream, in order.
pub fn synthesize(streams: &[StreamWiring<'_>]) -> HarnessResult<SynthesizedConfig> {
    if streams.is_empty() {
        return Err(HarnessError::config("at least one stream is required"));
    }

    let mut inputs = Vec::with_capacity(streams.len());
    let mut outputs = Vec::with_capacity(streams.len());
    for (ordinal, wiring) in streams.iter().enumerate() {
        inputs.push(input_clause(ordinal, wiring)?);
        outputs.push(output_clause(ordinal, wiring.sink_path)?);
    }

    Ok(SynthesizedConfig { inputs, outputs })
}

/// Client-mode socket input for one stream, tagged with its ordinal.
pub fn input_clause(ordinal: usize, wiring: &StreamWiring<'_>) -> HarnessResult<String> {
    let mut fields = wiring.fields.clone();
    let metadata = fields
        .entry(METADATA_FIELD)
        .or_insert_with(|| Value::Object(FieldSet::new()));
    match metadata {
        Value::Object(map) => {
            map.insert(
                STREAM_METADATA_KEY.to_string(),
                Value::String(ordinal.to_string()),
            );
        }
        _ => {
            return Err(HarnessError::config(format!(
                "field {METADATA_FIELD} must be an object"
            )))
        }
    }

    Ok(format!(
        "unix {{ mode => \"client\" path => {} codec => {} tags => [{}] add_field => {} }}",
        quote_path(wiring.socket_path)?,
        quote(wiring.codec),
        quote(&stream_tag(ordinal)),
        render_hash(&fields)?
    ))
}

/// File output that only matches events carrying this stream's ordinal.
pub fn output_clause(ordinal: usize, sink_path: &Path) -> HarnessResult<String> {
    Ok(format!(
        "if [{METADATA_FIELD}][{STREAM_METADATA_KEY}] == {} {{ file {{ path => {} codec => {} }} }}",
        quote(&ordinal.to_string()),
        quote_path(sink_path)?,
        quote(OUTPUT_CODEC)
    ))
}

/// Render a field map as an engine hash literal. Nested objects become
/// bracketed field references, e.g. `"[@metadata][key]" => "value"`.
pub fn render_hash(fields: &FieldSet) -> HarnessResult<String> {
    let mut entries = Vec::new();
    for (key, value) in fields {
        flatten(&mut vec![key.as_str()], value, &mut entries)?;
    }
    if entries.is_empty() {
        return Ok("{ }".to_string());
    }
    Ok(format!("{{ {} }}", entries.join(" ")))
}

fn flatten<'a>(
    path: &mut Vec<&'a str>,
    value: &'a Value,
    entries: &mut Vec<String>,
) -> HarnessResult<()> {
    if let Value::Object(map) = value {
        for (key, nested) in map {
            path.push(key);
            flatten(path, nested, entries)?;
            path.pop();
        }
        return Ok(());
    }

    let key = if path.len() == 1 {
        path[0].to_string()
    } else {
        path.iter().map(|segment| format!("[{segment}]")).collect()
    };
    let rendered = match value {
        Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| render_scalar(&key, item))
                .collect::<HarnessResult<Vec<_>>>()?;
            format!("[{}]", items.join(", "))
        }
        scalar => render_scalar(&key, scalar)?,
    };
    entries.push(format!("{} => {}", quote(&key), rendered));
    Ok(())
}

fn render_scalar(key: &str, value: &Value) -> HarnessResult<String> {
    match value {
        Value::String(text) => Ok(quote(text)),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Null => Err(HarnessError::config(format!("field {key} has no value"))),
        Value::Array(_) | Value::Object(_) => Err(HarnessError::config(format!(
            "field {key} may only hold scalar list items"
        ))),
    }
}

fn quote(text: &str) -> String {
    // JSON string escaping is a subset the engine's double-quoted strings accept.
    Value::String(text.to_string()).to_string()
}

fn quote_path(path: &Path) -> HarnessResult<String> {
    path.to_str()
        .map(quote)
        .ok_or_else(|| HarnessError::config(format!("path {} is not UTF-8", path.display())))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> FieldSet {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn input_clause_injects_stream_ordinal() {
        let socket = PathBuf::from("/tmp/lfv-stream-a/socket");
        let sink = PathBuf::from("/tmp/lfv-sink-a.jsonl");
        let user = fields(json!({"type": "syslog"}));
        let wiring = StreamWiring {
            socket_path: &socket,
            sink_path: &sink,
            codec: "json_lines",
            fields: &user,
        };

        let clause = input_clause(2, &wiring).expect("clause");
        assert_eq!(
            clause,
            "unix { mode => \"client\" path => \"/tmp/lfv-stream-a/socket\" codec => \"json_lines\" \
             tags => [\"__lfv_stream_2\"] add_field => { \"[@metadata][__lfv_testcase]\" => \"2\" \
             \"type\" => \"syslog\" } }"
        );
    }

    #[test]
    fn output_clause_is_guarded_by_ordinal() {
        let clause = output_clause(0, Path::new("/tmp/sink")).expect("clause");
        assert_eq!(
            clause,
            "if [@metadata][__lfv_testcase] == \"0\" { file { path => \"/tmp/sink\" codec => \"json_lines\" } }"
        );
    }

    #[test]
    fn nested_fields_become_references() {
        let rendered = render_hash(&fields(json!({
            "host": {"name": "web-1", "ports": [80, 443]},
            "enabled": true,
        })))
        .expect("hash");
        assert_eq!(
            rendered,
            "{ \"enabled\" => true \"[host][name]\" => \"web-1\" \"[host][ports]\" => [80, 443] }"
        );
    }

    #[test]
    fn null_fields_are_rejected() {
        let err = render_hash(&fields(json!({"broken": null}))).expect_err("null value");
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn list_items_must_be_scalars() {
        for value in [json!({"ports": [[80]]}), json!({"hosts": [{"name": "a"}]})] {
            let err = render_hash(&fields(value)).expect_err("nested list item");
            assert!(err.to_string().contains("scalar list items"), "{err}");
        }
    }

    #[test]
    fn metadata_must_be_an_object() {
        let user = fields(json!({"@metadata": "oops"}));
        let path = PathBuf::from("/tmp/x");
        let wiring = StreamWiring {
            socket_path: &path,
            sink_path: &path,
            codec: "line",
            fields: &user,
        };
        assert!(input_clause(0, &wiring).is_err());
    }

    #[test]
    fn synthesis_requires_streams() {
        assert!(matches!(synthesize(&[]), Err(HarnessError::Config(_))));
    }

    #[test]
    fn pipeline_text_joins_clauses_with_spaces() {
        let config = SynthesizedConfig {
            inputs: vec!["a {}".into(), "b {}".into()],
            outputs: vec!["c {}".into()],
        };
        assert_eq!(config.pipeline_text(), "input { a {} b {} } output { c {} }");
    }
}
