// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn transformers_key_format() {
    let yaml = r#"
transformers:
  - source: "a:*"
    target: "b:copy"
  - source: "c:d"
    target: "e:f"
    async: true
"#;
    let defs = load_transformer_str(yaml).unwrap();
    assert_eq!(defs.len(), 2);
    assert_eq!(defs[0].source, "a:*");
    assert!(defs[1].is_async);
}

#[test]
fn multi_document_format() {
    let yaml = r#"
source: "a:b"
target: "c:d"
---
source: "e:f"
target: "g:h"
"#;
    let defs = load_transformer_str(yaml).unwrap();
    assert_eq!(defs.len(), 2);
}

#[test]
fn bare_list_format() {
    let yaml = r#"
- source: "a:b"
  target: "c:d"
- source: "e:f"
  target: "g:h"
"#;
    let defs = load_transformer_str(yaml).unwrap();
    assert_eq!(defs.len(), 2);
}

#[test]
fn invalid_definitions_are_skipped() {
    let yaml = r#"
transformers:
  - source: "a:b"
    target: "c:d"
  - source: "missing target"
"#;
    let defs = load_transformer_str(yaml).unwrap();
    assert_eq!(defs.len(), 1);
}

#[test]
fn directory_loading_sorted_and_missing_ok() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_transformer_dir(&dir.path().join("absent")).unwrap().is_empty());

    std::fs::write(
        dir.path().join("b_second.yaml"),
        "source: b:1\ntarget: b:2\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("a_first.yaml"),
        "source: a:1\ntarget: a:2\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("ignored.txt"), "not yaml").unwrap();

    let defs = load_transformer_dir(dir.path()).unwrap();
    assert_eq!(defs.len(), 2);
    assert_eq!(defs[0].source, "a:1");
    assert_eq!(defs[1].source, "b:1");
}

#[test]
fn unparseable_file_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.yaml"), ": not : valid : yaml :").unwrap();
    std::fs::write(dir.path().join("good.yaml"), "source: a:1\ntarget: a:2\n").unwrap();

    let defs = load_transformer_dir(dir.path()).unwrap();
    assert_eq!(defs.len(), 1);
}
