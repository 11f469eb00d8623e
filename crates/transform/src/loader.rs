// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Loader for system transformer files.
//!
//! Each `*.yaml` file under the system transformers directory holds one or
//! more definitions, in any of three accepted shapes: a document with a
//! `transformers:` list, a bare definition per document (multi-document
//! streams supported), or a document that is itself a list of definitions.

use crate::definition::TransformerDef;
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Parse transformer definitions from YAML text.
///
/// Documents that are not recognizable transformer shapes are skipped with
/// a warning rather than failing the whole file.
pub fn load_transformer_str(text: &str) -> Result<Vec<TransformerDef>, serde_yaml::Error> {
    let mut defs = Vec::new();

    for document in serde_yaml::Deserializer::from_str(text) {
        let value = YamlValue::deserialize(document)?;
        collect_from_document(&value, &mut defs);
    }

    Ok(defs)
}

fn collect_from_document(value: &YamlValue, defs: &mut Vec<TransformerDef>) {
    match value {
        YamlValue::Mapping(map) => {
            if let Some(list) = map.get("transformers") {
                if let YamlValue::Sequence(items) = list {
                    for item in items {
                        push_definition(item, defs);
                    }
                }
            } else {
                push_definition(value, defs);
            }
        }
        YamlValue::Sequence(items) => {
            for item in items {
                push_definition(item, defs);
            }
        }
        YamlValue::Null => {}
        other => {
            warn!(document = ?other, "skipping non-mapping transformer document");
        }
    }
}

fn push_definition(value: &YamlValue, defs: &mut Vec<TransformerDef>) {
    match serde_yaml::from_value::<TransformerDef>(value.clone()) {
        Ok(def) => defs.push(def),
        Err(e) => warn!(error = %e, "skipping invalid transformer definition"),
    }
}

/// Load every definition from `*.yaml` files in `dir`.
///
/// A missing directory is not an error; the daemon simply has no system
/// transformers to install. Files that fail to parse are reported and the
/// rest still load.
pub fn load_transformer_dir(dir: &Path) -> Result<Vec<TransformerDef>, LoaderError> {
    let mut defs = Vec::new();
    if !dir.exists() {
        debug!(dir = %dir.display(), "system transformers directory does not exist");
        return Ok(defs);
    }

    let entries = std::fs::read_dir(dir).map_err(|source| LoaderError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "yaml" || ext == "yml"))
        .collect();
    paths.sort();

    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|source| LoaderError::Io {
            path: path.clone(),
            source,
        })?;
        match load_transformer_str(&text) {
            Ok(mut file_defs) => {
                debug!(file = %path.display(), count = file_defs.len(), "loaded transformer file");
                defs.append(&mut file_defs);
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "failed to parse transformer file");
            }
        }
    }

    Ok(defs)
}

#[cfg(test)]
#[path = "loader_tests.rs"]
mod tests;
