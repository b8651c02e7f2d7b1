// SPDX-License-Identifier: Apache-2.0

//! A small hand-written reader for the flat `[section]` / `key = value`
//! grammar the original framework reads through `inih`
//! (`thirdparty/inih-master`). Deliberately minimal: no multi-line
//! values, no escape sequences — just enough to round-trip the
//! handful of scalar settings [`crate::cfg::config::Config`] needs.

use std::collections::HashMap;

use anyhow::{Result, bail};

/// Parses `text` into a `(section, key) -> value` map. `;` and `#`
/// start a comment that runs to end of line; keys outside any
/// `[section]` header are rejected.
pub fn parse(text: &str) -> Result<HashMap<(String, String), String>> {
    let mut out = HashMap::new();
    let mut section = String::new();

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(stripped) = line.strip_prefix('[') {
            let name = stripped
                .strip_suffix(']')
                .ok_or_else(|| anyhow::anyhow!("unterminated section header at line {}", lineno + 1))?;
            section = name.trim().to_string();
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected key = value at line {}", lineno + 1))?;
        if section.is_empty() {
            bail!("key {:?} at line {} is outside any [section]", key.trim(), lineno + 1);
        }
        out.insert((section.clone(), key.trim().to_string()), value.trim().to_string());
    }

    Ok(out)
}

fn strip_comment(line: &str) -> &str {
    let cut = line
        .char_indices()
        .find(|(_, c)| *c == ';' || *c == '#')
        .map(|(i, _)| i);
    match cut {
        Some(i) => &line[..i],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_scalar_keys() {
        let text = "; a comment\n[rpc]\ncodec = json # trailing comment\nlisten = tcp://127.0.0.1:7500\n\n[runtime]\nstack_size_kb = 128\n";
        let kv = parse(text).expect("parse");
        assert_eq!(kv.get(&("rpc".to_string(), "codec".to_string())), Some(&"json".to_string()));
        assert_eq!(kv.get(&("runtime".to_string(), "stack_size_kb".to_string())), Some(&"128".to_string()));
    }

    #[test]
    fn rejects_a_key_before_any_section_header() {
        let err = parse("codec = json\n").expect_err("no section");
        assert!(err.to_string().contains("outside any"));
    }
}
