// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool bundles, the typed tool catalogue, and the action parser.
//!
//! A bundle is a directory with a `bundle.yaml` manifest (typed tool
//! declarations), a `bash.rc` defining the shell functions, and any support
//! files.  Bundles are parsed once into a [`ToolCatalogue`]; the LM-facing
//! documentation, the parser grammar, and the sandbox install plan are all
//! derived from that single typed source.

mod bundle;
mod catalogue;
mod parser;

use std::path::PathBuf;

pub use bundle::{ArgSpec, ArgType, BundleError, TimeoutClass, ToolBundle, ToolSpec};
pub use catalogue::ToolCatalogue;
pub use parser::{ActionParser, ParseError, ParsedAction};

/// Load every configured bundle directory and build the catalogue.
pub fn load_catalogue(bundle_dirs: &[PathBuf]) -> Result<ToolCatalogue, BundleError> {
    let mut bundles = Vec::with_capacity(bundle_dirs.len());
    for dir in bundle_dirs {
        bundles.push(ToolBundle::load(dir)?);
    }
    ToolCatalogue::build(bundles)
}

/// The built-in bundle shipped when no bundles are configured: an editor
/// surface plus the terminal `submit` tool, with shell passthrough covering
/// everything else.
pub fn builtin_bundle_manifest() -> &'static str {
    include_str!("builtin_bundle.yaml")
}

/// Materialize the built-in bundle into a directory and load it.
pub fn builtin_catalogue(scratch: &std::path::Path) -> Result<ToolCatalogue, BundleError> {
    let dir = scratch.join("defaults");
    std::fs::create_dir_all(&dir).map_err(|source| BundleError::Io {
        bundle: "defaults".into(),
        source,
    })?;
    std::fs::write(dir.join("bundle.yaml"), builtin_bundle_manifest()).map_err(|source| {
        BundleError::Io {
            bundle: "defaults".into(),
            source,
        }
    })?;
    std::fs::write(dir.join("bash.rc"), include_str!("builtin_bundle.rc")).map_err(|source| {
        BundleError::Io {
            bundle: "defaults".into(),
            source,
        }
    })?;
    let bundle = ToolBundle::load(&dir)?;
    ToolCatalogue::build(vec![bundle])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_bundle_loads_and_has_terminal_tool() {
        let dir = tempfile::tempdir().unwrap();
        let cat = builtin_catalogue(dir.path()).unwrap();
        let submit = cat.get("submit").expect("submit tool");
        assert!(submit.is_terminal);
    }

    #[test]
    fn builtin_bundle_docs_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        let cat = builtin_catalogue(dir.path()).unwrap();
        assert!(cat.docs().contains("submit"));
        assert!(cat.docs().contains("open"));
    }

    #[test]
    fn builtin_bundle_seeds_window_env() {
        let dir = tempfile::tempdir().unwrap();
        let cat = builtin_catalogue(dir.path()).unwrap();
        assert!(cat.env_defaults().contains_key("WINDOW"));
    }

    #[test]
    fn load_catalogue_propagates_bundle_errors() {
        assert!(load_catalogue(&[PathBuf::from("/no/such/bundle")]).is_err());
    }
}
