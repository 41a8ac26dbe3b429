// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors raised while loading and validating tool bundles.  All of them are
/// configuration defects and therefore fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("bundle {bundle}: reading manifest: {source}")]
    Io {
        bundle: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bundle {bundle}: parsing manifest: {source}")]
    Parse {
        bundle: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("duplicate tool name {name:?} (bundles {first} and {second})")]
    DuplicateTool {
        name: String,
        first: String,
        second: String,
    },
    #[error("bundle {bundle}: tool {tool}: {reason}")]
    InvalidTool {
        bundle: String,
        tool: String,
        reason: String,
    },
    #[error("no terminal tool declared; at least one tool must end the episode")]
    NoTerminalTool,
}

/// Declared type of a tool argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    #[default]
    String,
    Integer,
    Boolean,
    Enum,
}

/// One argument in a tool's signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub arg_type: ArgType,
    /// Allowed values; only meaningful (and then mandatory) for enum args.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

fn default_required() -> bool {
    true
}

/// How long the dispatched command may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutClass {
    /// Edits, navigation, quick inspections.
    #[default]
    Short,
    /// Installs, builds, test suites.
    Long,
}

/// One declared tool.  The handler itself is a shell function defined in the
/// bundle's `bash.rc`; this is the typed half that drives validation, docs,
/// and the action grammar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    pub name: String,
    /// Shown verbatim to the model.
    pub docstring: String,
    #[serde(default)]
    pub arguments: Vec<ArgSpec>,
    /// Invoking this tool ends the episode.
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(default)]
    pub timeout_class: TimeoutClass,
}

impl ToolSpec {
    /// Render the `name <required> [<optional>]` signature line.
    pub fn signature(&self) -> String {
        let mut out = self.name.clone();
        for arg in &self.arguments {
            if arg.required {
                out.push_str(&format!(" <{}>", arg.name));
            } else {
                out.push_str(&format!(" [<{}>]", arg.name));
            }
        }
        out
    }
}

/// Manifest file (`bundle.yaml`) at the root of a bundle directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BundleManifest {
    name: Option<String>,
    /// Script run once per environment after the bundle files are copied in.
    install: Option<String>,
    /// Environment variables seeded into the persisted env store.
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    tools: Vec<ToolSpec>,
}

/// A loaded tool bundle: the typed tool list plus everything the installer
/// needs (source directory, install step, default env vars).
#[derive(Debug, Clone)]
pub struct ToolBundle {
    pub name: String,
    pub source_dir: PathBuf,
    pub install: Option<String>,
    pub env: HashMap<String, String>,
    pub tools: Vec<ToolSpec>,
}

impl ToolBundle {
    /// Load a bundle from its directory.  The manifest is `bundle.yaml`;
    /// every other file in the directory ships into the sandbox unchanged.
    pub fn load(dir: &Path) -> Result<Self, BundleError> {
        let fallback_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into());
        let manifest_path = dir.join("bundle.yaml");
        let text = std::fs::read_to_string(&manifest_path).map_err(|source| BundleError::Io {
            bundle: fallback_name.clone(),
            source,
        })?;
        let manifest: BundleManifest =
            serde_yaml::from_str(&text).map_err(|source| BundleError::Parse {
                bundle: fallback_name.clone(),
                source,
            })?;

        let name = manifest.name.unwrap_or(fallback_name);
        let bundle = Self {
            name,
            source_dir: dir.to_path_buf(),
            install: manifest.install,
            env: manifest.env,
            tools: manifest.tools,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    fn validate(&self) -> Result<(), BundleError> {
        for tool in &self.tools {
            if tool.name.is_empty() || tool.name.contains(char::is_whitespace) {
                return Err(BundleError::InvalidTool {
                    bundle: self.name.clone(),
                    tool: tool.name.clone(),
                    reason: "tool names must be single non-empty words".into(),
                });
            }
            let mut required_done = false;
            for arg in &tool.arguments {
                if arg.arg_type == ArgType::Enum && arg.values.is_empty() {
                    return Err(BundleError::InvalidTool {
                        bundle: self.name.clone(),
                        tool: tool.name.clone(),
                        reason: format!("enum argument {:?} declares no values", arg.name),
                    });
                }
                if arg.arg_type != ArgType::Enum && !arg.values.is_empty() {
                    return Err(BundleError::InvalidTool {
                        bundle: self.name.clone(),
                        tool: tool.name.clone(),
                        reason: format!("argument {:?} lists values but is not an enum", arg.name),
                    });
                }
                // Optional arguments must trail: positional parsing cannot
                // skip a hole in the middle of the signature.
                if arg.required && required_done {
                    return Err(BundleError::InvalidTool {
                        bundle: self.name.clone(),
                        tool: tool.name.clone(),
                        reason: format!(
                            "required argument {:?} follows an optional one",
                            arg.name
                        ),
                    });
                }
                if !arg.required {
                    required_done = true;
                }
            }
        }
        Ok(())
    }

    /// Path of the rc file sourced into every new shell session, if present.
    pub fn rc_file(&self) -> Option<PathBuf> {
        let rc = self.source_dir.join("bash.rc");
        rc.is_file().then_some(rc)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn write_bundle(dir: &Path, manifest: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("bundle.yaml"), manifest).unwrap();
    }

    const DEFAULTS: &str = r#"
name: defaults
install: "true"
env:
  WINDOW: "100"
tools:
  - name: open
    docstring: opens the file at the given path in the editor
    arguments:
      - name: path
        type: string
        required: true
        description: the path to the file to open
      - name: line_number
        type: integer
        required: false
        description: the line to scroll the window to
  - name: submit
    docstring: submits your current code and terminates the session
    is_terminal: true
"#;

    #[test]
    fn load_parses_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), DEFAULTS);
        let b = ToolBundle::load(dir.path()).unwrap();
        assert_eq!(b.name, "defaults");
        assert_eq!(b.tools.len(), 2);
        assert_eq!(b.env.get("WINDOW").map(String::as_str), Some("100"));
        assert!(b.tools[1].is_terminal);
    }

    #[test]
    fn signature_marks_optional_arguments() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), DEFAULTS);
        let b = ToolBundle::load(dir.path()).unwrap();
        assert_eq!(b.tools[0].signature(), "open <path> [<line_number>]");
    }

    #[test]
    fn missing_manifest_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ToolBundle::load(dir.path()),
            Err(BundleError::Io { .. })
        ));
    }

    #[test]
    fn enum_without_values_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(
            dir.path(),
            r#"
tools:
  - name: scroll
    docstring: scrolls
    arguments:
      - name: direction
        type: enum
"#,
        );
        assert!(matches!(
            ToolBundle::load(dir.path()),
            Err(BundleError::InvalidTool { .. })
        ));
    }

    #[test]
    fn required_after_optional_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(
            dir.path(),
            r#"
tools:
  - name: bad
    docstring: broken signature
    arguments:
      - name: a
        required: false
      - name: b
        required: true
"#,
        );
        assert!(matches!(
            ToolBundle::load(dir.path()),
            Err(BundleError::InvalidTool { .. })
        ));
    }

    #[test]
    fn tool_spec_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), DEFAULTS);
        let b = ToolBundle::load(dir.path()).unwrap();
        // Docstrings and argument lists survive serialisation unchanged.
        let yaml = serde_yaml::to_string(&b.tools).unwrap();
        let back: Vec<ToolSpec> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, b.tools);
    }

    #[test]
    fn rc_file_detected_when_present() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), DEFAULTS);
        assert!(ToolBundle::load(dir.path()).unwrap().rc_file().is_none());
        std::fs::write(dir.path().join("bash.rc"), "open() { :; }\n").unwrap();
        assert!(ToolBundle::load(dir.path()).unwrap().rc_file().is_some());
    }
}
