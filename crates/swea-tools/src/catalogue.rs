// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use crate::bundle::{BundleError, ToolBundle, ToolSpec};

/// The validated, typed action surface of a run.
///
/// Built once from the loaded bundles; both the LM-facing documentation and
/// the action parser's grammar derive from this single source.  Shared
/// read-only across agent loops.
#[derive(Debug)]
pub struct ToolCatalogue {
    bundles: Vec<ToolBundle>,
    /// tool name → (bundle index, tool index)
    by_name: HashMap<String, (usize, usize)>,
}

impl ToolCatalogue {
    pub fn build(bundles: Vec<ToolBundle>) -> Result<Self, BundleError> {
        let mut by_name: HashMap<String, (usize, usize)> = HashMap::new();
        for (bi, bundle) in bundles.iter().enumerate() {
            for (ti, tool) in bundle.tools.iter().enumerate() {
                if let Some((prev_bi, _)) = by_name.get(&tool.name) {
                    return Err(BundleError::DuplicateTool {
                        name: tool.name.clone(),
                        first: bundles[*prev_bi].name.clone(),
                        second: bundle.name.clone(),
                    });
                }
                by_name.insert(tool.name.clone(), (bi, ti));
            }
        }
        let catalogue = Self { bundles, by_name };
        if !catalogue.tools().any(|t| t.is_terminal) {
            return Err(BundleError::NoTerminalTool);
        }
        Ok(catalogue)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.by_name
            .get(name)
            .map(|(bi, ti)| &self.bundles[*bi].tools[*ti])
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolSpec> {
        self.bundles.iter().flat_map(|b| b.tools.iter())
    }

    pub fn bundles(&self) -> &[ToolBundle] {
        &self.bundles
    }

    /// Environment defaults from all bundles, later bundles winning.
    pub fn env_defaults(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for bundle in &self.bundles {
            env.extend(bundle.env.clone());
        }
        env
    }

    /// The command documentation block shown to the model, compiled from the
    /// typed tool specs.  Tools appear in bundle order, with their docstrings
    /// verbatim.
    pub fn docs(&self) -> String {
        let mut out = String::new();
        for tool in self.tools() {
            out.push_str(&format!("{}:\n", tool.name));
            out.push_str(&format!("  docstring: {}\n", tool.docstring));
            out.push_str(&format!("  signature: {}\n", tool.signature()));
            if !tool.arguments.is_empty() {
                out.push_str("  arguments:\n");
                for arg in &tool.arguments {
                    let kind = match arg.arg_type {
                        crate::ArgType::Enum => format!("enum {:?}", arg.values),
                        other => format!("{other:?}").to_lowercase(),
                    };
                    let req = if arg.required { "required" } else { "optional" };
                    out.push_str(&format!(
                        "    - {} ({kind}) [{req}]: {}\n",
                        arg.name, arg.description
                    ));
                }
            }
            out.push('\n');
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::bundle::{ArgSpec, ArgType, TimeoutClass};

    fn tool(name: &str, is_terminal: bool) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            docstring: format!("{name} does things"),
            arguments: vec![],
            is_terminal,
            timeout_class: TimeoutClass::Short,
        }
    }

    fn bundle(name: &str, tools: Vec<ToolSpec>) -> ToolBundle {
        ToolBundle {
            name: name.into(),
            source_dir: PathBuf::from("/nonexistent"),
            install: None,
            env: HashMap::new(),
            tools,
        }
    }

    #[test]
    fn build_indexes_tools_across_bundles() {
        let cat = ToolCatalogue::build(vec![
            bundle("a", vec![tool("open", false)]),
            bundle("b", vec![tool("submit", true)]),
        ])
        .unwrap();
        assert!(cat.get("open").is_some());
        assert!(cat.get("submit").is_some());
        assert!(cat.get("missing").is_none());
    }

    #[test]
    fn duplicate_names_across_bundles_rejected() {
        let err = ToolCatalogue::build(vec![
            bundle("a", vec![tool("open", false), tool("submit", true)]),
            bundle("b", vec![tool("open", false)]),
        ])
        .unwrap_err();
        match err {
            BundleError::DuplicateTool { name, first, second } => {
                assert_eq!(name, "open");
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            other => panic!("wrong error: {other}"),
        }
    }

    #[test]
    fn missing_terminal_tool_rejected() {
        let err = ToolCatalogue::build(vec![bundle("a", vec![tool("open", false)])]).unwrap_err();
        assert!(matches!(err, BundleError::NoTerminalTool));
    }

    #[test]
    fn env_defaults_later_bundle_wins() {
        let mut a = bundle("a", vec![tool("submit", true)]);
        a.env.insert("WINDOW".into(), "100".into());
        let mut b = bundle("b", vec![]);
        b.env.insert("WINDOW".into(), "50".into());
        let cat = ToolCatalogue::build(vec![a, b]).unwrap();
        assert_eq!(cat.env_defaults().get("WINDOW").map(String::as_str), Some("50"));
    }

    #[test]
    fn docs_contain_docstring_verbatim() {
        let mut t = tool("open", false);
        t.docstring = "opens the file at the given path".into();
        t.arguments = vec![ArgSpec {
            name: "path".into(),
            arg_type: ArgType::String,
            values: vec![],
            required: true,
            description: "the file to open".into(),
        }];
        let cat = ToolCatalogue::build(vec![bundle("a", vec![t, tool("submit", true)])]).unwrap();
        let docs = cat.docs();
        assert!(docs.contains("opens the file at the given path"));
        assert!(docs.contains("signature: open <path>"));
        assert!(docs.contains("- path (string) [required]: the file to open"));
    }
}
