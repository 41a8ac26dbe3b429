// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::bundle::{ArgType, TimeoutClass, ToolSpec};
use crate::catalogue::ToolCatalogue;

/// A reply that could not be turned into exactly one valid tool call.
///
/// The Display text is shown to the model through the format-error template,
/// so every message states what was wrong in terms the model can act on.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("no action found in the reply; emit exactly one command in a ```-fenced block")]
    Empty,
    #[error("unknown tool {0:?}")]
    UnknownTool(String),
    #[error("{tool}: {reason}")]
    BadArgs { tool: String, reason: String },
    #[error("the command {0:?} is not allowed in this environment")]
    Blocked(String),
    #[error("expected exactly one action, found {0} fenced blocks")]
    Multiple(usize),
}

/// One validated tool call extracted from a model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAction {
    /// Free-form reasoning text surrounding the action block.
    pub thought: String,
    /// Tool name, or the first word of a passthrough shell command.
    pub name: String,
    /// Typed arguments keyed by declared name.  Empty for passthrough.
    pub args: HashMap<String, Value>,
    /// The exact command dispatched to the session shell.  For multi-line
    /// action blocks this includes the payload lines verbatim.
    pub command: String,
    pub is_terminal: bool,
    pub timeout_class: TimeoutClass,
}

/// Parses model replies against a tool catalogue.
///
/// Two reply formats are understood:
/// 1. thought text with exactly one ```-fenced block holding the command;
/// 2. a bare JSON object `{"name": ..., "arguments": {...}}`.
pub struct ActionParser {
    catalogue: Arc<ToolCatalogue>,
    blocked: Vec<String>,
    shell_passthrough: bool,
}

impl ActionParser {
    pub fn new(catalogue: Arc<ToolCatalogue>, blocked: Vec<String>, shell_passthrough: bool) -> Self {
        Self {
            catalogue,
            blocked,
            shell_passthrough,
        }
    }

    /// The catalogue this parser validates against.
    pub fn catalogue(&self) -> &ToolCatalogue {
        &self.catalogue
    }

    pub fn parse(&self, reply: &str) -> Result<ParsedAction, ParseError> {
        if reply.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        // Function-call style: the whole reply is one JSON object.
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(reply.trim()) {
            if obj.contains_key("name") {
                return self.parse_function_call(&obj);
            }
        }

        let (thought, blocks) = split_fenced_blocks(reply);
        match blocks.len() {
            0 => Err(ParseError::Empty),
            1 => self.parse_command_block(thought, &blocks[0]),
            n => Err(ParseError::Multiple(n)),
        }
    }

    fn parse_command_block(
        &self,
        thought: String,
        block: &str,
    ) -> Result<ParsedAction, ParseError> {
        let command = block.trim_matches('\n').to_string();
        if command.trim().is_empty() {
            return Err(ParseError::Empty);
        }
        self.check_blocked(&command)?;

        let first_line = command.lines().next().unwrap_or_default();
        let tokens = shell_tokens(first_line);
        let name = tokens.first().cloned().ok_or(ParseError::Empty)?;

        let Some(tool) = self.catalogue.get(&name) else {
            if self.shell_passthrough {
                return Ok(ParsedAction {
                    thought,
                    name,
                    args: HashMap::new(),
                    command,
                    is_terminal: false,
                    timeout_class: TimeoutClass::Short,
                });
            }
            return Err(ParseError::UnknownTool(name));
        };

        let args = bind_positional_args(tool, &tokens[1..])?;
        Ok(ParsedAction {
            thought,
            name,
            args,
            command,
            is_terminal: tool.is_terminal,
            timeout_class: tool.timeout_class,
        })
    }

    fn parse_function_call(
        &self,
        obj: &serde_json::Map<String, Value>,
    ) -> Result<ParsedAction, ParseError> {
        let name = obj["name"].as_str().unwrap_or_default().to_string();
        if name.is_empty() {
            return Err(ParseError::Empty);
        }
        let tool = self
            .catalogue
            .get(&name)
            .ok_or_else(|| ParseError::UnknownTool(name.clone()))?;
        let thought = obj
            .get("thought")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let given: HashMap<String, Value> = match obj.get("arguments") {
            Some(Value::Object(m)) => m.clone().into_iter().collect(),
            None => HashMap::new(),
            Some(_) => {
                return Err(ParseError::BadArgs {
                    tool: name,
                    reason: "arguments must be an object".into(),
                })
            }
        };

        let args = check_named_args(tool, given)?;
        let command = render_command_line(tool, &args)?;
        self.check_blocked(&command)?;
        Ok(ParsedAction {
            thought,
            name,
            args,
            command,
            is_terminal: tool.is_terminal,
            timeout_class: tool.timeout_class,
        })
    }

    fn check_blocked(&self, command: &str) -> Result<(), ParseError> {
        let trimmed = command.trim();
        for blocked in &self.blocked {
            if trimmed == blocked || trimmed.starts_with(&format!("{blocked} ")) {
                return Err(ParseError::Blocked(trimmed.into()));
            }
        }
        Ok(())
    }
}

/// Split a reply into (thought text, fenced code blocks).  A line starting
/// with ``` toggles block state; an optional language tag after the fence is
/// ignored.
fn split_fenced_blocks(reply: &str) -> (String, Vec<String>) {
    let mut thought = String::new();
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in reply.lines() {
        if line.trim_start().starts_with("```") {
            match current.take() {
                Some(block) => blocks.push(block),
                None => current = Some(String::new()),
            }
            continue;
        }
        match current.as_mut() {
            Some(block) => {
                block.push_str(line);
                block.push('\n');
            }
            None => {
                thought.push_str(line);
                thought.push('\n');
            }
        }
    }
    // An unterminated fence still counts as a block; the model often omits
    // the closing fence when it runs out of output budget.
    if let Some(block) = current {
        blocks.push(block);
    }
    (thought.trim().to_string(), blocks)
}

/// Minimal shell-style tokenizer: whitespace-separated words with single and
/// double quoting.  Good enough for command signatures; payload lines after
/// the first are never tokenized.
fn shell_tokens(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_word = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        tokens.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if in_word {
        tokens.push(current);
    }
    tokens
}

/// Map positional tokens onto a tool's declared arguments, checking arity
/// and parsing each token against its declared type.
fn bind_positional_args(
    tool: &ToolSpec,
    tokens: &[String],
) -> Result<HashMap<String, Value>, ParseError> {
    let required = tool.arguments.iter().filter(|a| a.required).count();
    if tokens.len() < required {
        return Err(ParseError::BadArgs {
            tool: tool.name.clone(),
            reason: format!(
                "expected at least {required} argument(s) ({}), got {}",
                tool.signature(),
                tokens.len()
            ),
        });
    }

    let mut args = HashMap::new();
    let mut tokens = tokens.iter();
    for (i, spec) in tool.arguments.iter().enumerate() {
        let is_last = i + 1 == tool.arguments.len();
        let Some(token) = tokens.next() else { break };
        // A trailing string argument absorbs the rest of the line so that
        // free-text arguments do not need quoting.
        let raw = if is_last && spec.arg_type == ArgType::String {
            let rest: Vec<&str> = tokens.by_ref().map(String::as_str).collect();
            if rest.is_empty() {
                token.clone()
            } else {
                format!("{token} {}", rest.join(" "))
            }
        } else {
            token.clone()
        };
        args.insert(spec.name.clone(), parse_typed(tool, spec.arg_type, &spec.values, &spec.name, &raw)?);
    }

    if tokens.next().is_some() {
        return Err(ParseError::BadArgs {
            tool: tool.name.clone(),
            reason: format!("too many arguments; signature is {}", tool.signature()),
        });
    }
    Ok(args)
}

fn parse_typed(
    tool: &ToolSpec,
    arg_type: ArgType,
    values: &[String],
    name: &str,
    raw: &str,
) -> Result<Value, ParseError> {
    match arg_type {
        ArgType::String => Ok(Value::String(raw.into())),
        ArgType::Integer => raw.parse::<i64>().map(Value::from).map_err(|_| {
            ParseError::BadArgs {
                tool: tool.name.clone(),
                reason: format!("argument {name:?} must be an integer, got {raw:?}"),
            }
        }),
        ArgType::Boolean => match raw {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(ParseError::BadArgs {
                tool: tool.name.clone(),
                reason: format!("argument {name:?} must be true or false, got {raw:?}"),
            }),
        },
        ArgType::Enum => {
            if values.iter().any(|v| v == raw) {
                Ok(Value::String(raw.into()))
            } else {
                Err(ParseError::BadArgs {
                    tool: tool.name.clone(),
                    reason: format!("argument {name:?} must be one of {values:?}, got {raw:?}"),
                })
            }
        }
    }
}

/// Validate a named-argument map (function-call format) against the tool
/// signature: required args present, no undeclared keys, types match.
fn check_named_args(
    tool: &ToolSpec,
    given: HashMap<String, Value>,
) -> Result<HashMap<String, Value>, ParseError> {
    for key in given.keys() {
        if !tool.arguments.iter().any(|a| &a.name == key) {
            return Err(ParseError::BadArgs {
                tool: tool.name.clone(),
                reason: format!("undeclared argument {key:?}"),
            });
        }
    }
    let mut args = HashMap::new();
    for spec in &tool.arguments {
        match given.get(&spec.name) {
            Some(value) => {
                let ok = match spec.arg_type {
                    ArgType::String => value.is_string(),
                    ArgType::Integer => value.is_i64() || value.is_u64(),
                    ArgType::Boolean => value.is_boolean(),
                    ArgType::Enum => value
                        .as_str()
                        .map(|s| spec.values.iter().any(|v| v == s))
                        .unwrap_or(false),
                };
                if !ok {
                    return Err(ParseError::BadArgs {
                        tool: tool.name.clone(),
                        reason: format!(
                            "argument {:?} has the wrong type (expected {:?})",
                            spec.name, spec.arg_type
                        ),
                    });
                }
                args.insert(spec.name.clone(), value.clone());
            }
            None if spec.required => {
                return Err(ParseError::BadArgs {
                    tool: tool.name.clone(),
                    reason: format!("missing required argument {:?}", spec.name),
                });
            }
            None => {}
        }
    }
    Ok(args)
}

/// Rebuild the shell command line for a named-argument call: the tool name
/// followed by the declared arguments in signature order.
fn render_command_line(
    tool: &ToolSpec,
    args: &HashMap<String, Value>,
) -> Result<String, ParseError> {
    let mut line = tool.name.clone();
    let mut gap = false;
    for spec in &tool.arguments {
        match args.get(&spec.name) {
            Some(value) => {
                if gap {
                    return Err(ParseError::BadArgs {
                        tool: tool.name.clone(),
                        reason: format!(
                            "argument {:?} given but an earlier optional argument was omitted",
                            spec.name
                        ),
                    });
                }
                let rendered = match value {
                    Value::String(s) => shell_quote(s),
                    other => other.to_string(),
                };
                line.push(' ');
                line.push_str(&rendered);
            }
            None => gap = true,
        }
    }
    Ok(line)
}

/// Quote a string for the shell when it needs it.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || "._-/:=+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;
    use std::path::PathBuf;

    use super::*;
    use crate::bundle::{ArgSpec, ToolBundle};

    fn arg(name: &str, arg_type: ArgType, required: bool) -> ArgSpec {
        ArgSpec {
            name: name.into(),
            arg_type,
            values: vec![],
            required,
            description: String::new(),
        }
    }

    fn catalogue() -> Arc<ToolCatalogue> {
        let tools = vec![
            ToolSpec {
                name: "open".into(),
                docstring: "opens a file".into(),
                arguments: vec![
                    arg("path", ArgType::String, true),
                    arg("line_number", ArgType::Integer, false),
                ],
                is_terminal: false,
                timeout_class: TimeoutClass::Short,
            },
            ToolSpec {
                name: "scroll".into(),
                docstring: "scrolls the window".into(),
                arguments: vec![ArgSpec {
                    name: "direction".into(),
                    arg_type: ArgType::Enum,
                    values: vec!["up".into(), "down".into()],
                    required: true,
                    description: String::new(),
                }],
                is_terminal: false,
                timeout_class: TimeoutClass::Short,
            },
            ToolSpec {
                name: "search_dir".into(),
                docstring: "searches a directory".into(),
                arguments: vec![arg("term", ArgType::String, true)],
                is_terminal: false,
                timeout_class: TimeoutClass::Short,
            },
            ToolSpec {
                name: "submit".into(),
                docstring: "ends the episode".into(),
                arguments: vec![],
                is_terminal: true,
                timeout_class: TimeoutClass::Short,
            },
        ];
        let bundle = ToolBundle {
            name: "defaults".into(),
            source_dir: PathBuf::from("/nonexistent"),
            install: None,
            env: Map::new(),
            tools,
        };
        Arc::new(ToolCatalogue::build(vec![bundle]).unwrap())
    }

    fn parser() -> ActionParser {
        ActionParser::new(catalogue(), vec!["su".into()], true)
    }

    fn strict_parser() -> ActionParser {
        ActionParser::new(catalogue(), vec!["su".into()], false)
    }

    // ── Fenced-block format ───────────────────────────────────────────────────

    #[test]
    fn parses_thought_and_single_block() {
        let action = parser()
            .parse("Let me look at that file.\n```\nopen src/main.rs 10\n```")
            .unwrap();
        assert_eq!(action.thought, "Let me look at that file.");
        assert_eq!(action.name, "open");
        assert_eq!(action.args["path"], Value::String("src/main.rs".into()));
        assert_eq!(action.args["line_number"], Value::from(10));
        assert!(!action.is_terminal);
    }

    #[test]
    fn empty_reply_is_empty_error() {
        assert!(matches!(parser().parse("   \n  "), Err(ParseError::Empty)));
    }

    #[test]
    fn reply_without_block_is_empty_error() {
        assert!(matches!(
            parser().parse("I think we should edit the file."),
            Err(ParseError::Empty)
        ));
    }

    #[test]
    fn empty_block_is_empty_error() {
        assert!(matches!(
            parser().parse("thought\n```\n\n```"),
            Err(ParseError::Empty)
        ));
    }

    #[test]
    fn two_blocks_is_multiple_error() {
        let reply = "```\nls\n```\nand then\n```\nsubmit\n```";
        assert!(matches!(parser().parse(reply), Err(ParseError::Multiple(2))));
    }

    #[test]
    fn unterminated_fence_still_parses() {
        let action = parser().parse("done\n```\nsubmit").unwrap();
        assert_eq!(action.name, "submit");
        assert!(action.is_terminal);
    }

    #[test]
    fn language_tag_after_fence_is_ignored() {
        let action = parser().parse("```bash\nopen a.txt\n```").unwrap();
        assert_eq!(action.name, "open");
    }

    #[test]
    fn multi_line_block_keeps_payload_verbatim() {
        let reply = "replacing the line\n```\nsearch_dir needle\nextra payload\nend\n```";
        let action = parser().parse(reply).unwrap();
        assert_eq!(action.command, "search_dir needle\nextra payload\nend");
    }

    #[test]
    fn consecutive_identical_actions_both_parse() {
        let p = parser();
        let a = p.parse("```\nscroll down\n```").unwrap();
        let b = p.parse("```\nscroll down\n```").unwrap();
        assert_eq!(a, b);
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn missing_required_argument_is_bad_args() {
        assert!(matches!(
            parser().parse("```\nopen\n```"),
            Err(ParseError::BadArgs { .. })
        ));
    }

    #[test]
    fn too_many_arguments_is_bad_args() {
        assert!(matches!(
            parser().parse("```\nscroll down fast\n```"),
            Err(ParseError::BadArgs { .. })
        ));
    }

    #[test]
    fn integer_argument_type_checked() {
        assert!(matches!(
            parser().parse("```\nopen a.txt ten\n```"),
            Err(ParseError::BadArgs { .. })
        ));
    }

    #[test]
    fn enum_argument_membership_checked() {
        assert!(matches!(
            parser().parse("```\nscroll sideways\n```"),
            Err(ParseError::BadArgs { .. })
        ));
        assert!(parser().parse("```\nscroll up\n```").is_ok());
    }

    #[test]
    fn trailing_string_argument_absorbs_rest_of_line() {
        let action = parser().parse("```\nsearch_dir foo bar baz\n```").unwrap();
        assert_eq!(action.args["term"], Value::String("foo bar baz".into()));
    }

    #[test]
    fn blocked_command_is_blocked_error() {
        assert!(matches!(
            parser().parse("```\nsu root\n```"),
            Err(ParseError::Blocked(_))
        ));
    }

    #[test]
    fn blocked_match_is_word_anchored() {
        // `summarize` starts with `su` but is a different word.
        let action = parser().parse("```\nsummarize notes.txt\n```").unwrap();
        assert_eq!(action.name, "summarize");
    }

    // ── Passthrough vs strict ─────────────────────────────────────────────────

    #[test]
    fn passthrough_accepts_plain_shell_commands() {
        let action = parser().parse("checking\n```\nls -la /tmp\n```").unwrap();
        assert_eq!(action.name, "ls");
        assert_eq!(action.command, "ls -la /tmp");
        assert!(action.args.is_empty());
    }

    #[test]
    fn strict_mode_rejects_unknown_tools() {
        assert!(matches!(
            strict_parser().parse("```\nls -la\n```"),
            Err(ParseError::UnknownTool(name)) if name == "ls"
        ));
    }

    // ── Function-call format ──────────────────────────────────────────────────

    #[test]
    fn function_call_format_parses() {
        let reply = r#"{"name": "open", "arguments": {"path": "src/lib.rs", "line_number": 3}, "thought": "peek"}"#;
        let action = parser().parse(reply).unwrap();
        assert_eq!(action.name, "open");
        assert_eq!(action.thought, "peek");
        assert_eq!(action.command, "open src/lib.rs 3");
    }

    #[test]
    fn function_call_missing_required_is_bad_args() {
        let reply = r#"{"name": "open", "arguments": {}}"#;
        assert!(matches!(
            parser().parse(reply),
            Err(ParseError::BadArgs { .. })
        ));
    }

    #[test]
    fn function_call_undeclared_key_is_bad_args() {
        let reply = r#"{"name": "submit", "arguments": {"bogus": 1}}"#;
        assert!(matches!(
            parser().parse(reply),
            Err(ParseError::BadArgs { .. })
        ));
    }

    #[test]
    fn function_call_unknown_tool_is_unknown_even_with_passthrough() {
        // Passthrough is a property of shell command lines, not of the
        // structured format: a JSON call must name a declared tool.
        let reply = r#"{"name": "rm", "arguments": {}}"#;
        assert!(matches!(
            parser().parse(reply),
            Err(ParseError::UnknownTool(_))
        ));
    }

    #[test]
    fn function_call_quotes_strings_with_spaces() {
        let reply = r#"{"name": "search_dir", "arguments": {"term": "two words"}}"#;
        let action = parser().parse(reply).unwrap();
        assert_eq!(action.command, "search_dir 'two words'");
    }

    // ── Tokenizer ─────────────────────────────────────────────────────────────

    #[test]
    fn tokenizer_respects_quotes() {
        assert_eq!(
            shell_tokens(r#"open "a file.txt" 3"#),
            vec!["open", "a file.txt", "3"]
        );
        assert_eq!(shell_tokens("echo 'x  y'"), vec!["echo", "x  y"]);
    }

    #[test]
    fn tokenizer_handles_escapes() {
        assert_eq!(shell_tokens(r"open a\ b.txt"), vec!["open", "a b.txt"]);
    }

    #[test]
    fn shell_quote_passes_safe_strings() {
        assert_eq!(shell_quote("src/main.rs"), "src/main.rs");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
