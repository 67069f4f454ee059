//! YAML frontmatter parsing and serialization for graph node files
//!
//! Parses the YAML frontmatter block at the start of a node's markdown file:
//! ```markdown
//! ---
//! id: omg/identity/name
//! type: identity
//! ---
//!
//! Body content here...
//! ```

use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Parsed frontmatter as a map of string keys to JSON values.
/// Using JSON values allows flexible typing (strings, numbers, arrays, objects)
/// so unknown fields round-trip without a schema.
pub type Frontmatter = HashMap<String, JsonValue>;

/// A parsed note with frontmatter separated from content.
///
/// The `content` field borrows from `raw` to avoid unnecessary allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNote<'a> {
    /// The frontmatter key-value pairs, if present
    pub frontmatter: Option<Frontmatter>,
    /// The note content after the frontmatter (borrows from raw)
    pub content: &'a str,
    /// The raw file content (frontmatter + content)
    pub raw: &'a str,
}

/// Split a note into frontmatter YAML string and content, without parsing the YAML.
///
/// Returns (frontmatter_yaml, content) where frontmatter_yaml is None if
/// no valid frontmatter block was found.
pub fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    // Frontmatter must start at the very beginning with ---
    if !raw.starts_with("---") {
        return (None, raw);
    }

    let after_opening = &raw[3..];

    let content_start = if after_opening.starts_with('\n') {
        &after_opening[1..]
    } else if after_opening.starts_with("\r\n") {
        &after_opening[2..]
    } else {
        // No newline after opening --- means invalid frontmatter
        return (None, raw);
    };

    // Find closing --- (must be at start of line)
    if let Some(close_pos) = find_closing_delimiter(content_start) {
        let yaml = &content_start[..close_pos];
        let after_close = &content_start[close_pos + 3..];

        let content = if after_close.starts_with('\n') {
            &after_close[1..]
        } else if after_close.starts_with("\r\n") {
            &after_close[2..]
        } else {
            after_close
        };

        (Some(yaml), content)
    } else {
        (None, raw)
    }
}

/// Find the position of the closing --- delimiter (must be at start of line)
fn find_closing_delimiter(s: &str) -> Option<usize> {
    let mut pos = 0;
    for line in s.lines() {
        if line == "---" || line == "---\r" {
            return Some(pos);
        }
        pos += line.len() + 1; // +1 for newline
    }
    None
}

/// Parse a note's raw content into frontmatter and content.
///
/// The frontmatter is parsed as YAML and converted to a HashMap with JSON values.
/// The returned `ParsedNote` borrows from the input string.
pub fn parse_frontmatter(raw: &str) -> ParsedNote<'_> {
    let (yaml_str, content) = split_frontmatter(raw);

    let frontmatter = yaml_str.and_then(|yaml| {
        serde_yaml::from_str::<serde_yaml::Value>(yaml)
            .ok()
            .and_then(yaml_to_json_map)
    });

    ParsedNote {
        frontmatter,
        content,
        raw,
    }
}

/// Serialize frontmatter plus body back into the `---\n<yaml>---\n<body>` shape
/// `parse_frontmatter` expects. The inverse of `parse_frontmatter` for the
/// frontmatter-present case.
pub fn build_note_with_frontmatter(
    frontmatter: &Frontmatter,
    content: &str,
) -> Result<String, serde_yaml::Error> {
    if frontmatter.is_empty() {
        return Ok(content.to_string());
    }

    // serde_yaml serializes maps in an unspecified order; sort keys so
    // writes are deterministic and diff-friendly.
    let mut sorted: Vec<(&String, &JsonValue)> = frontmatter.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut ordered = serde_yaml::Mapping::new();
    for (k, v) in sorted {
        ordered.insert(
            serde_yaml::Value::String(k.clone()),
            json_to_yaml(v.clone()),
        );
    }

    let yaml = serde_yaml::to_string(&serde_yaml::Value::Mapping(ordered))?;
    Ok(format!("---\n{yaml}---\n{content}"))
}

/// Convert a YAML value to a JSON HashMap (for the top-level frontmatter)
fn yaml_to_json_map(yaml: serde_yaml::Value) -> Option<Frontmatter> {
    match yaml {
        serde_yaml::Value::Mapping(map) => {
            let mut result = HashMap::new();
            for (k, v) in map {
                if let serde_yaml::Value::String(key) = k {
                    result.insert(key, yaml_to_json(v));
                }
            }
            if result.is_empty() {
                None
            } else {
                Some(result)
            }
        }
        _ => None,
    }
}

/// Convert a YAML value to a JSON value
fn yaml_to_json(yaml: serde_yaml::Value) -> JsonValue {
    match yaml {
        serde_yaml::Value::Null => JsonValue::Null,
        serde_yaml::Value::Bool(b) => JsonValue::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                JsonValue::Number(i.into())
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            } else {
                JsonValue::Null
            }
        }
        serde_yaml::Value::String(s) => JsonValue::String(s),
        serde_yaml::Value::Sequence(seq) => {
            JsonValue::Array(seq.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let obj: serde_json::Map<String, JsonValue> = map
                .into_iter()
                .filter_map(|(k, v)| {
                    if let serde_yaml::Value::String(key) = k {
                        Some((key, yaml_to_json(v)))
                    } else {
                        None
                    }
                })
                .collect();
            JsonValue::Object(obj)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

/// Convert a JSON value to a YAML value (the inverse of `yaml_to_json`)
fn json_to_yaml(json: JsonValue) -> serde_yaml::Value {
    match json {
        JsonValue::Null => serde_yaml::Value::Null,
        JsonValue::Bool(b) => serde_yaml::Value::Bool(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_yaml::Value::Number(i.into())
            } else if let Some(f) = n.as_f64() {
                serde_yaml::Value::Number(f.into())
            } else {
                serde_yaml::Value::Null
            }
        }
        JsonValue::String(s) => serde_yaml::Value::String(s),
        JsonValue::Array(arr) => {
            serde_yaml::Value::Sequence(arr.into_iter().map(json_to_yaml).collect())
        }
        JsonValue::Object(obj) => {
            let mut map = serde_yaml::Mapping::new();
            for (k, v) in obj {
                map.insert(serde_yaml::Value::String(k), json_to_yaml(v));
            }
            serde_yaml::Value::Mapping(map)
        }
    }
}
