//! Mustache template renderer
//!
//! Consumes a JSON tree (`serde_json::Value`) and a template string and
//! emits text. Supported tag forms:
//!
//! - `{{name}}` — variable, HTML-escaped
//! - `{{{name}}}` / `{{&name}}` — variable, unescaped
//! - `{{%name}}` / `{{$name}}` — serialize the referenced JSON subtree
//!   (pretty / compact)
//! - `{{#name}}...{{/name}}` — section: repeats over arrays and objects,
//!   renders once for a truthy scalar, skips for a falsy one
//! - `{{^name}}...{{/name}}` — inverted section
//! - `{{!...}}` — comment
//! - `{{=<% %>=}}` — delimiter change (delimiters up to 10 bytes)
//!
//! Name resolution walks the stack of hashes bound by enclosing
//! sections, supports dotted paths, and `-top-` addresses the root.
//! `{{.}}` is the current iteration value, `{{@}}` the current iteration
//! key or index. A standalone tag (a structural tag alone on its line)
//! strips the whole line, including the newline.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Longest allowed delimiter string
const MAX_DELIM_SIZE: usize = 10;

/// A broken template or an unrenderable reference
#[derive(Debug, Error, PartialEq, Eq)]
#[error("template error: {message}")]
pub struct RenderError {
    pub message: String,
}

fn fail<T>(message: impl Into<String>) -> Result<T, RenderError> {
    let message = message.into();
    warn!("{message}");
    Err(RenderError { message })
}

/// Render `template` against the JSON tree `hash`
pub fn render(template: &str, hash: &Value) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut delims = Delims {
        start: "{{".to_string(),
        end: "}}".to_string(),
    };
    let mut stack: Vec<Option<&Value>> = vec![Some(hash)];
    render_at(
        template,
        0,
        &mut out,
        &mut stack,
        None,
        &mut delims,
        false,
        None,
    )?;
    Ok(out)
}

struct Delims {
    start: String,
    end: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Var,
    VarUnescaped,
    VarSerialized,
    VarSerializedCompact,
    Section,
    SectionEnd,
    Inverted,
    Comment,
    Delim,
}

struct Tag<'t> {
    kind: TagKind,
    /// Byte offset of the opening delimiter
    begin: usize,
    /// Byte offset just past the closing delimiter
    end: usize,
    /// Tag content with surrounding spaces and tabs removed
    content: &'t str,
}

fn next_tag<'t>(
    template: &'t str,
    from: usize,
    delims: &Delims,
) -> Result<Option<Tag<'t>>, RenderError> {
    let begin = match template[from..].find(&delims.start) {
        Some(offset) => from + offset,
        None => return Ok(None),
    };
    let after_start = begin + delims.start.len();
    let rest = &template[after_start..];

    let (kind, sigil_len, extra_end) = match rest.as_bytes().first() {
        Some(b'#') => (TagKind::Section, 1, None),
        Some(b'^') => (TagKind::Inverted, 1, None),
        Some(b'/') => (TagKind::SectionEnd, 1, None),
        Some(b'!') => (TagKind::Comment, 1, None),
        Some(b'=') => (TagKind::Delim, 1, Some('=')),
        Some(b'{') => (TagKind::VarUnescaped, 1, Some('}')),
        Some(b'&') => (TagKind::VarUnescaped, 1, None),
        Some(b'%') => (TagKind::VarSerialized, 1, None),
        Some(b'$') => (TagKind::VarSerializedCompact, 1, None),
        _ => (TagKind::Var, 0, None),
    };

    let content_start = after_start + sigil_len;
    let (content_end, end) = if let Some(extra) = extra_end {
        let close = match template[content_start..].find(extra) {
            Some(offset) => content_start + offset,
            None => {
                return fail(format!(
                    "broken template, no end for quoted tag at {:.20}...",
                    &template[begin..]
                ))
            }
        };
        if !template[close + extra.len_utf8()..].starts_with(&delims.end) {
            return fail(format!(
                "broken template, no end delimiter for quoted tag at {:.20}...",
                &template[begin..]
            ));
        }
        (close, close + extra.len_utf8() + delims.end.len())
    } else {
        let close = match template[content_start..].find(&delims.end) {
            Some(offset) => content_start + offset,
            None => {
                return fail(format!(
                    "broken template, no end delimiter after start delimiter at {:.20}...",
                    &template[begin..]
                ))
            }
        };
        (close, close + delims.end.len())
    };

    let content = template[content_start..content_end].trim_matches(|c| c == ' ' || c == '\t');
    Ok(Some(Tag {
        kind,
        begin,
        end,
        content,
    }))
}

fn is_renderable(kind: TagKind) -> bool {
    matches!(
        kind,
        TagKind::Var | TagKind::VarUnescaped | TagKind::VarSerialized | TagKind::VarSerializedCompact
    )
}

/// If the tag sits alone on its line (only blanks around it), the whole
/// line is stripped: returns the line's start and the offset just past
/// its newline.
fn standalone_line(template: &str, tag_begin: usize, tag_end: usize) -> Option<(usize, usize)> {
    let bytes = template.as_bytes();

    let mut line_begin = 0;
    for i in (0..tag_begin).rev() {
        match bytes[i] {
            b' ' | b'\t' => continue,
            b'\n' => {
                line_begin = i + 1;
                break;
            }
            _ => return None,
        }
    }

    let mut i = tag_end;
    let line_end = loop {
        match bytes.get(i) {
            Some(b' ') | Some(b'\t') | Some(b'\r') => i += 1,
            Some(b'\n') => break i + 1,
            None => break i,
            _ => return None,
        }
    };

    Some((line_begin, line_end))
}

fn html_escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn lookup<'v>(stack: &[Option<&'v Value>], name: &str) -> Option<&'v Value> {
    let mut components = name.split('.');
    let base = components.next()?;

    let mut base_var = if base == "-top-" {
        stack.first().copied().flatten()
    } else {
        None
    };
    for frame in stack.iter().rev() {
        if let Some(Value::Object(map)) = frame {
            if let Some(value) = map.get(base) {
                base_var = Some(value);
                break;
            }
        }
    }

    let mut var = base_var?;
    for component in components {
        match var {
            Value::Object(map) => var = map.get(component)?,
            _ => return None,
        }
    }
    Some(var)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => true,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn render_primitive(
    out: &mut String,
    value: &Value,
    escaped: bool,
) -> Result<(), RenderError> {
    match value {
        Value::Null => Ok(()),
        Value::Bool(b) => {
            out.push_str(if *b { "true" } else { "false" });
            Ok(())
        }
        Value::Number(n) => {
            out.push_str(&n.to_string());
            Ok(())
        }
        Value::String(s) => {
            if escaped {
                html_escape_into(out, s);
            } else {
                out.push_str(s);
            }
            Ok(())
        }
        _ => fail("expected a primitive JSON value"),
    }
}

fn render_variable(
    out: &mut String,
    content: &str,
    kind: TagKind,
    stack: &[Option<&Value>],
    json_key: Option<&str>,
) -> Result<(), RenderError> {
    let escaped = kind == TagKind::Var;
    let serialize = matches!(kind, TagKind::VarSerialized | TagKind::VarSerializedCompact);

    let item_mode = content == ".";
    let key_mode = content == "@";

    if key_mode {
        let key = match json_key {
            Some(key) => key,
            None => {
                return fail(
                    "the {{@}} tag must be used where there is an iteration key or position",
                )
            }
        };
        if escaped {
            html_escape_into(out, key);
        } else {
            out.push_str(key);
        }
        return Ok(());
    }

    let var = if item_mode {
        stack.last().copied().flatten()
    } else {
        lookup(stack, content)
    };
    let var = match var {
        Some(var) => var,
        None => return Ok(()),
    };

    match var {
        Value::Array(_) | Value::Object(_) => {
            if serialize {
                let rendered = if kind == TagKind::VarSerializedCompact {
                    serde_json::to_string(var)
                } else {
                    serde_json::to_string_pretty(var)
                };
                match rendered {
                    Ok(text) => {
                        out.push_str(&text);
                        Ok(())
                    }
                    Err(err) => fail(format!("cannot serialize '{content}': {err}")),
                }
            } else {
                fail(format!(
                    "variable '{content}' is a container; use a serialize tag to emit it"
                ))
            }
        }
        primitive => render_primitive(out, primitive, escaped),
    }
}

fn set_delimiters(content: &str, delims: &mut Delims) -> Result<(), RenderError> {
    let tokens: Vec<&str> = content
        .split(|c: char| c == ' ' || c == '\t')
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() != 2 {
        return fail(format!(
            "could not parse delimiter tag, expected 2 tokens in '{content}'"
        ));
    }
    if tokens[0].len() > MAX_DELIM_SIZE || tokens[1].len() > MAX_DELIM_SIZE {
        return fail(format!(
            "new delimiter exceeds the allowed size of {MAX_DELIM_SIZE} in '{content}'"
        ));
    }
    delims.start = tokens[0].to_string();
    delims.end = tokens[1].to_string();
    Ok(())
}

/// Render from `pos` until the end of input (top level) or the matching
/// section-end tag. Returns the position just past what was consumed.
#[allow(clippy::too_many_arguments)]
fn render_at<'v>(
    template: &str,
    mut pos: usize,
    out: &mut String,
    stack: &mut Vec<Option<&'v Value>>,
    json_key: Option<&str>,
    delims: &mut Delims,
    skip: bool,
    in_section: Option<&str>,
) -> Result<usize, RenderError> {
    loop {
        let tag = match next_tag(template, pos, delims)? {
            Some(tag) => tag,
            None => {
                if let Some(name) = in_section {
                    return fail(format!("unexpected end of template inside section '{name}'"));
                }
                if !skip {
                    out.push_str(&template[pos..]);
                }
                return Ok(template.len());
            }
        };

        // Structural tags alone on a line take the whole line with them.
        let standalone = if is_renderable(tag.kind) {
            None
        } else {
            standalone_line(template, tag.begin, tag.end)
        };
        match standalone {
            Some((line_begin, line_end)) => {
                if !skip {
                    out.push_str(&template[pos..line_begin.max(pos)]);
                }
                pos = line_end;
            }
            None => {
                if !skip {
                    out.push_str(&template[pos..tag.begin]);
                }
                pos = tag.end;
            }
        }

        match tag.kind {
            TagKind::Delim => {
                set_delimiters(tag.content, delims)?;
            }

            TagKind::Comment => {}

            TagKind::Var
            | TagKind::VarUnescaped
            | TagKind::VarSerialized
            | TagKind::VarSerializedCompact => {
                if !skip {
                    if tag.content.is_empty() {
                        out.push_str(&delims.start);
                        out.push_str(&delims.end);
                    } else {
                        render_variable(out, tag.content, tag.kind, stack, json_key)?;
                    }
                }
            }

            TagKind::Section | TagKind::Inverted => {
                let inverted = tag.kind == TagKind::Inverted;
                let var = lookup(stack, tag.content);

                match var {
                    Some(value @ Value::Array(items)) if !items.is_empty() && !inverted => {
                        let mut section_end = pos;
                        for (index, item) in items.iter().enumerate() {
                            let key = index.to_string();
                            stack.push(Some(value));
                            stack.push(Some(item));
                            let result = render_at(
                                template,
                                pos,
                                out,
                                stack,
                                Some(key.as_str()),
                                delims,
                                skip,
                                Some(tag.content),
                            );
                            stack.pop();
                            stack.pop();
                            section_end = result?;
                        }
                        pos = section_end;
                    }
                    Some(value @ Value::Object(map)) if !map.is_empty() && !inverted => {
                        let mut section_end = pos;
                        for (key, item) in map {
                            stack.push(Some(value));
                            stack.push(Some(item));
                            let result = render_at(
                                template,
                                pos,
                                out,
                                stack,
                                Some(key.as_str()),
                                delims,
                                skip,
                                Some(tag.content),
                            );
                            stack.pop();
                            stack.pop();
                            section_end = result?;
                        }
                        pos = section_end;
                    }
                    other => {
                        // One pass over the section body, rendered or
                        // skipped depending on truthiness and polarity.
                        let truthy = other.map(is_truthy).unwrap_or(false);
                        let render_body = truthy != inverted;
                        stack.push(other);
                        let result = render_at(
                            template,
                            pos,
                            out,
                            stack,
                            json_key,
                            delims,
                            skip || !render_body,
                            Some(tag.content),
                        );
                        stack.pop();
                        pos = result?;
                    }
                }
            }

            TagKind::SectionEnd => {
                if in_section.is_none() {
                    return fail(format!(
                        "unknown section close in template: '{}'",
                        tag.content
                    ));
                }
                return Ok(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(render("hello world", &json!({})).unwrap(), "hello world");
    }

    #[test]
    fn variable_is_escaped() {
        let data = json!({"x": "<a href=\"y\">&</a>"});
        assert_eq!(
            render("{{x}}", &data).unwrap(),
            "&lt;a href=&quot;y&quot;&gt;&amp;&lt;/a&gt;"
        );
    }

    #[test]
    fn unescaped_variants() {
        let data = json!({"x": "<b>"});
        assert_eq!(render("{{{x}}}", &data).unwrap(), "<b>");
        assert_eq!(render("{{&x}}", &data).unwrap(), "<b>");
    }

    #[test]
    fn numbers_and_bools_render_plainly() {
        let data = json!({"n": 42, "f": 1.5, "t": true});
        assert_eq!(render("{{n}} {{f}} {{t}}", &data).unwrap(), "42 1.5 true");
    }

    #[test]
    fn missing_variable_renders_nothing() {
        assert_eq!(render("[{{missing}}]", &json!({})).unwrap(), "[]");
    }

    #[test]
    fn serialized_subtree_roundtrips() {
        let data = json!({"x": {"b": [1, 2, 3], "a": "text"}});
        let compact = render("{{$x}}", &data).unwrap();
        let reparsed: Value = serde_json::from_str(&compact).unwrap();
        assert_eq!(reparsed, data["x"]);

        let pretty = render("{{%x}}", &data).unwrap();
        let reparsed: Value = serde_json::from_str(&pretty).unwrap();
        assert_eq!(reparsed, data["x"]);
    }

    #[test]
    fn section_repeats_over_array() {
        let data = json!({"items": ["a", "b", "c"]});
        assert_eq!(
            render("{{#items}}<{{.}}>{{/items}}", &data).unwrap(),
            "<a><b><c>"
        );
    }

    #[test]
    fn array_iteration_exposes_index() {
        let data = json!({"items": ["a", "b"]});
        assert_eq!(
            render("{{#items}}{{@}}={{.}};{{/items}}", &data).unwrap(),
            "0=a;1=b;"
        );
    }

    #[test]
    fn section_over_object_binds_iteration_properties() {
        let data = json!({"ports": {"http": 80, "ssh": 22}});
        assert_eq!(
            render("{{#ports}}{{@}}:{{.}} {{/ports}}", &data).unwrap(),
            "http:80 ssh:22 "
        );
    }

    #[test]
    fn section_over_array_of_objects_resolves_fields() {
        let data = json!({"hosts": [
            {"name": "alpha", "ip": "10.0.0.1"},
            {"name": "beta", "ip": "10.0.0.2"}
        ]});
        assert_eq!(
            render("{{#hosts}}{{name}}@{{ip}} {{/hosts}}", &data).unwrap(),
            "alpha@10.0.0.1 beta@10.0.0.2 "
        );
    }

    #[test]
    fn boolean_sections() {
        let data = json!({"yes": true, "no": false});
        assert_eq!(render("{{#yes}}Y{{/yes}}{{#no}}N{{/no}}", &data).unwrap(), "Y");
        assert_eq!(render("{{^no}}N{{/no}}{{^yes}}Y{{/yes}}", &data).unwrap(), "N");
    }

    #[test]
    fn inverted_section_renders_for_absent_or_empty() {
        let data = json!({"empty": [], "full": [1]});
        assert_eq!(render("{{^missing}}M{{/missing}}", &data).unwrap(), "M");
        assert_eq!(render("{{^empty}}E{{/empty}}", &data).unwrap(), "E");
        assert_eq!(render("{{^full}}F{{/full}}", &data).unwrap(), "");
    }

    #[test]
    fn truthy_scalar_section_renders_once() {
        let data = json!({"name": "x"});
        assert_eq!(render("{{#name}}have name{{/name}}", &data).unwrap(), "have name");
        let data = json!({"name": ""});
        assert_eq!(render("{{#name}}have name{{/name}}", &data).unwrap(), "");
    }

    #[test]
    fn nested_sections_walk_the_stack() {
        let data = json!({
            "outer": {"label": "L"},
            "items": [{"v": 1}, {"v": 2}]
        });
        assert_eq!(
            render("{{#items}}{{v}}{{/items}}", &data).unwrap(),
            "12"
        );
        // Names not found in the innermost frame resolve further out.
        assert_eq!(
            render("{{#items}}{{v}}:{{top}};{{/items}}", &json!({
                "top": "T",
                "items": [{"v": 1}, {"v": 2}]
            }))
            .unwrap(),
            "1:T;2:T;"
        );
    }

    #[test]
    fn dotted_paths_and_top_accessor() {
        let data = json!({"a": {"b": {"c": "deep"}}, "root": "R"});
        assert_eq!(render("{{a.b.c}}", &data).unwrap(), "deep");
        assert_eq!(render("{{-top-.root}}", &data).unwrap(), "R");
    }

    #[test]
    fn comments_disappear() {
        assert_eq!(render("a{{! ignore me }}b", &json!({})).unwrap(), "ab");
    }

    #[test]
    fn standalone_tags_strip_their_line() {
        let data = json!({"items": [1, 2]});
        let template = "start\n{{#items}}\n{{.}}\n{{/items}}\nend\n";
        assert_eq!(render(template, &data).unwrap(), "start\n1\n2\nend\n");
    }

    #[test]
    fn inline_section_tags_keep_surrounding_text() {
        let data = json!({"x": true});
        assert_eq!(render("a {{#x}}b{{/x}} c", &data).unwrap(), "a b c");
    }

    #[test]
    fn delimiters_can_change() {
        let data = json!({"x": "v"});
        assert_eq!(
            render("{{=<% %>=}}<%x%> and {{x}}", &data).unwrap(),
            "v and {{x}}"
        );
    }

    #[test]
    fn oversized_delimiter_is_an_error() {
        assert!(render("{{=<<<<<<<<<<<<<<< >>=}}x", &json!({})).is_err());
    }

    #[test]
    fn unterminated_tag_is_an_error() {
        assert!(render("{{x", &json!({})).is_err());
        assert!(render("{{#a}}never closed", &json!({"a": true})).is_err());
        assert!(render("{{/a}}", &json!({})).is_err());
    }

    #[test]
    fn container_without_serialize_tag_is_an_error() {
        assert!(render("{{x}}", &json!({"x": {"a": 1}})).is_err());
    }

    #[test]
    fn empty_tag_renders_delimiters() {
        assert_eq!(render("{{}}", &json!({})).unwrap(), "{{}}");
    }
}
