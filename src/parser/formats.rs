use super::{ParsedDocument, Section, TextParser};
use crate::error::{RagError, Result};
use pulldown_cmark::{CodeBlockKind, Event, Parser as CmarkParser, Tag, TagEnd};
use serde_json::Value as JsonValue;

/// Whole file as one section; also the fallback for failed structured parses
pub struct PlainTextParser;

impl TextParser for PlainTextParser {
    fn can_parse(&self, _extension: &str) -> bool {
        true
    }

    fn parse(&self, content: &str, _path: &str) -> Result<ParsedDocument> {
        Ok(ParsedDocument {
            content: content.to_string(),
            sections: vec![Section {
                header: "content".to_string(),
                content: content.trim().to_string(),
            }],
            doc_type: "plaintext".to_string(),
        })
    }
}

/// Markdown split into one section per heading
pub struct MarkdownParser;

impl TextParser for MarkdownParser {
    fn can_parse(&self, extension: &str) -> bool {
        matches!(extension, "md" | "markdown")
    }

    fn parse(&self, content: &str, _path: &str) -> Result<ParsedDocument> {
        let mut sections = Vec::new();
        let mut header = String::new();
        let mut body = String::new();
        let mut in_heading = false;

        let mut flush = |header: &mut String, body: &mut String| {
            if !body.trim().is_empty() {
                sections.push(Section {
                    header: std::mem::take(header),
                    content: body.trim().to_string(),
                });
            } else {
                header.clear();
            }
            body.clear();
        };

        for event in CmarkParser::new(content) {
            match event {
                Event::Start(Tag::Heading { .. }) => {
                    flush(&mut header, &mut body);
                    in_heading = true;
                }
                Event::End(TagEnd::Heading(_)) => in_heading = false,
                Event::Text(text) | Event::Code(text) => {
                    if in_heading {
                        header.push_str(&text);
                    } else {
                        body.push_str(&text);
                    }
                }
                Event::Start(Tag::CodeBlock(kind)) => {
                    let lang = match kind {
                        CodeBlockKind::Fenced(lang) => lang.to_string(),
                        CodeBlockKind::Indented => String::new(),
                    };
                    body.push_str(&format!("\n```{}\n", lang));
                }
                Event::End(TagEnd::CodeBlock) => body.push_str("```\n"),
                Event::End(TagEnd::Paragraph) | Event::End(TagEnd::Item) => body.push('\n'),
                Event::SoftBreak | Event::HardBreak => body.push(' '),
                _ => {}
            }
        }
        flush(&mut header, &mut body);

        if sections.is_empty() {
            return Err(RagError::Parse("Markdown document has no text".to_string()));
        }

        Ok(ParsedDocument {
            content: content.to_string(),
            sections,
            doc_type: "markdown".to_string(),
        })
    }
}

/// JSON flattened to `path: value` lines, one section per top-level key
pub struct JsonParser;

impl TextParser for JsonParser {
    fn can_parse(&self, extension: &str) -> bool {
        extension == "json"
    }

    fn parse(&self, content: &str, path: &str) -> Result<ParsedDocument> {
        let value: JsonValue = serde_json::from_str(content)
            .map_err(|e| RagError::Parse(format!("JSON parse error in {}: {}", path, e)))?;
        Ok(structured_document(&value, content, "json"))
    }
}

/// YAML flattened the same way as JSON
pub struct YamlParser;

impl TextParser for YamlParser {
    fn can_parse(&self, extension: &str) -> bool {
        matches!(extension, "yaml" | "yml")
    }

    fn parse(&self, content: &str, path: &str) -> Result<ParsedDocument> {
        let yaml: serde_yaml_ng::Value = serde_yaml_ng::from_str(content)
            .map_err(|e| RagError::Parse(format!("YAML parse error in {}: {}", path, e)))?;
        let value = serde_json::to_value(yaml)
            .map_err(|e| RagError::Parse(format!("Unsupported YAML structure in {}: {}", path, e)))?;
        Ok(structured_document(&value, content, "yaml"))
    }
}

fn structured_document(value: &JsonValue, raw: &str, doc_type: &str) -> ParsedDocument {
    let sections = match value {
        JsonValue::Object(map) if !map.is_empty() => map
            .iter()
            .map(|(key, v)| {
                let mut lines = Vec::new();
                flatten(v, key, &mut lines);
                Section {
                    header: key.clone(),
                    content: lines.join("\n"),
                }
            })
            .collect(),
        other => {
            let mut lines = Vec::new();
            flatten(other, "", &mut lines);
            vec![Section {
                header: "content".to_string(),
                content: lines.join("\n"),
            }]
        }
    };

    ParsedDocument {
        content: raw.to_string(),
        sections,
        doc_type: doc_type.to_string(),
    }
}

fn flatten(value: &JsonValue, path: &str, out: &mut Vec<String>) {
    let join = |suffix: &str| {
        if path.is_empty() { suffix.to_string() } else { format!("{}.{}", path, suffix) }
    };
    match value {
        JsonValue::Object(map) => {
            for (k, v) in map {
                flatten(v, &join(k), out);
            }
        }
        JsonValue::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten(v, &format!("{}[{}]", path, i), out);
            }
        }
        JsonValue::String(s) => out.push(format!("{}: {}", path, s)),
        JsonValue::Null => {}
        other => out.push(format!("{}: {}", path, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_sections_by_heading() {
        let md = "Intro line.\n\n# Paris\nParis is the capital of France.\n\n## Landmarks\n- Eiffel Tower\n- Louvre\n\n```sh\nls\n```\n";
        let doc = MarkdownParser.parse(md, "guide.md").unwrap();
        assert_eq!(doc.sections.len(), 3);
        assert_eq!(doc.sections[0].header, "");
        assert_eq!(doc.sections[1].header, "Paris");
        assert!(doc.sections[1].content.contains("capital of France"));
        assert_eq!(doc.sections[2].header, "Landmarks");
        assert!(doc.sections[2].content.contains("Louvre"));
        assert!(doc.sections[2].content.contains("```sh"));
    }

    #[test]
    fn test_markdown_headings_only_is_error() {
        assert!(MarkdownParser.parse("# Empty\n## Also empty\n", "x.md").is_err());
    }

    #[test]
    fn test_json_flattened() {
        let json = r#"{"city": {"name": "Paris", "population": 2100000}, "tags": ["capital", "europe"]}"#;
        let doc = JsonParser.parse(json, "city.json").unwrap();
        assert_eq!(doc.sections.len(), 2);
        let city = doc.sections.iter().find(|s| s.header == "city").unwrap();
        assert!(city.content.contains("city.name: Paris"));
        assert!(city.content.contains("city.population: 2100000"));
        let tags = doc.sections.iter().find(|s| s.header == "tags").unwrap();
        assert!(tags.content.contains("tags[1]: europe"));
    }

    #[test]
    fn test_json_scalar_root() {
        let doc = JsonParser.parse(r#""just text""#, "s.json").unwrap();
        assert_eq!(doc.sections[0].content, ": just text");
    }

    #[test]
    fn test_yaml_flattened() {
        let yaml = "country: France\ncapital:\n  name: Paris\n";
        let doc = YamlParser.parse(yaml, "geo.yaml").unwrap();
        assert_eq!(doc.doc_type, "yaml");
        let capital = doc.sections.iter().find(|s| s.header == "capital").unwrap();
        assert_eq!(capital.content, "capital.name: Paris");
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = YamlParser.parse("a: [unclosed", "bad.yml").unwrap_err();
        assert!(matches!(err, RagError::Parse(_)));
    }
}
