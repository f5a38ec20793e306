//! Pure text edits applied to note content: anchored blocks, frontmatter
//! field merges and wiki-link rewriting.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use vaultward_core::{ConflictKind, Placement};

static WIKI_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\[\]]+)\]\]").expect("wiki link pattern is valid"));

/// Why an edit could not be located in the current document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("heading `{0}` not found")]
    MissingAnchor(String),
    #[error("`{0}` matches more than once")]
    AmbiguousAnchor(String),
    #[error("{0}")]
    MalformedStructure(String),
}

impl EditError {
    pub fn conflict_kind(&self) -> ConflictKind {
        match self {
            Self::MissingAnchor(_) => ConflictKind::MissingAnchor,
            Self::AmbiguousAnchor(_) => ConflictKind::AmbiguousAnchor,
            Self::MalformedStructure(_) => ConflictKind::MalformedStructure,
        }
    }
}

fn with_trailing_newline(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}

/// Insert `block` according to `placement`. At the end of the document the
/// block is separated from existing text by one blank line.
pub fn insert_block(content: &str, block: &str, placement: &Placement) -> Result<String, EditError> {
    let block = with_trailing_newline(block);
    match placement {
        Placement::End => {
            let separator = if content.is_empty() || content.ends_with("\n\n") {
                ""
            } else if content.ends_with('\n') {
                "\n"
            } else {
                "\n\n"
            };
            Ok(format!("{content}{separator}{block}"))
        }
        Placement::AfterHeading { heading } => {
            let wanted = heading.trim();
            let mut offsets = Vec::new();
            let mut offset = 0usize;
            for line in content.split_inclusive('\n') {
                if line.trim_end() == wanted {
                    offsets.push(offset + line.len());
                }
                offset += line.len();
            }
            match offsets.as_slice() {
                [] => Err(EditError::MissingAnchor(wanted.to_string())),
                [end] => {
                    let (head, tail) = content.split_at(*end);
                    let newline = if head.ends_with('\n') { "" } else { "\n" };
                    Ok(format!("{head}{newline}{block}{tail}"))
                }
                _ => Err(EditError::AmbiguousAnchor(wanted.to_string())),
            }
        }
    }
}

pub fn count_occurrences(content: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    content.matches(needle).count()
}

/// Documents that `content` could have been before `block` was inserted.
/// Empty unless the block occurs exactly once.
pub fn strip_block_candidates(content: &str, block: &str) -> Vec<String> {
    let block = with_trailing_newline(block);
    let mut found = content.match_indices(block.as_str());
    let (Some((idx, _)), None) = (found.next(), found.next()) else {
        return Vec::new();
    };
    let before = &content[..idx];
    let after = &content[idx + block.len()..];
    let mut candidates = vec![format!("{before}{after}")];
    let mut trimmed = before;
    for _ in 0..2 {
        match trimmed.strip_suffix('\n') {
            Some(rest) => {
                trimmed = rest;
                candidates.push(format!("{trimmed}{after}"));
            }
            None => break,
        }
    }
    candidates
}

/// Add list-valued frontmatter keys that are missing. Existing keys are left
/// alone. Returns `None` when every key is already present.
pub fn merge_frontmatter(content: &str, fields: &BTreeMap<String, Vec<String>>) -> Result<Option<String>, EditError> {
    let (existing, body_start, closing_start) = match parse_frontmatter(content)? {
        Some(parsed) => parsed,
        None => (Vec::new(), 0, 0),
    };

    let missing: Vec<_> = fields
        .iter()
        .filter(|(key, _)| !existing.iter().any(|k| k == *key))
        .collect();
    if missing.is_empty() {
        return Ok(None);
    }

    let mut rendered = String::new();
    for (key, values) in missing {
        if values.is_empty() {
            rendered.push_str(&format!("{key}: []\n"));
        } else {
            rendered.push_str(&format!("{key}:\n"));
            for value in values {
                rendered.push_str(&format!("  - {value}\n"));
            }
        }
    }

    if body_start == 0 {
        return Ok(Some(format!("---\n{rendered}---\n{content}")));
    }
    let (head, tail) = content.split_at(closing_start);
    Ok(Some(format!("{head}{rendered}{tail}")))
}

/// Top-level keys of a leading `---` block, with the byte offset after the
/// block and the offset of its closing fence.
fn parse_frontmatter(content: &str) -> Result<Option<(Vec<String>, usize, usize)>, EditError> {
    let mut lines = content.split_inclusive('\n');
    match lines.next() {
        Some(first) if first.trim_end() == "---" => {}
        _ => return Ok(None),
    }
    let mut offset = content.split_inclusive('\n').next().map_or(0, str::len);
    let mut keys = Vec::new();
    for line in lines {
        if line.trim_end() == "---" {
            return Ok(Some((keys, offset + line.len(), offset)));
        }
        let starts_key = line
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if starts_key {
            match line.split_once(':') {
                Some((key, _)) => keys.push(key.trim().to_string()),
                None => {
                    return Err(EditError::MalformedStructure(format!(
                        "frontmatter line is not a key: {}",
                        line.trim_end()
                    )));
                }
            }
        }
        offset += line.len();
    }
    Err(EditError::MalformedStructure("frontmatter is not closed".to_string()))
}

fn without_md(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    raw.strip_suffix(".md").map(str::to_string).unwrap_or(raw)
}

fn link_target_matches(name: &str, from: &Path) -> bool {
    let name = name.trim();
    let name = name.strip_suffix(".md").unwrap_or(name);
    if name.contains('/') {
        name == without_md(from)
    } else {
        name == vaultward_core::paths::note_stem(from)
    }
}

/// Wiki links in `content` that point at the note `from`.
pub fn count_links_to(content: &str, from: &Path) -> usize {
    WIKI_LINK
        .captures_iter(content)
        .filter(|caps| {
            let inner = &caps[1];
            let target = inner.split('|').next().unwrap_or(inner);
            let name = target.split('#').next().unwrap_or(target);
            link_target_matches(name, from)
        })
        .count()
}

/// Point every wiki link to `from` at `to`, keeping aliases, heading
/// fragments, an explicit `.md` suffix and the path-vs-stem link form.
pub fn rewrite_links(content: &str, from: &Path, to: &Path) -> (String, usize) {
    let mut rewritten = 0usize;
    let out = WIKI_LINK.replace_all(content, |caps: &Captures<'_>| {
        let inner = &caps[1];
        let (target, alias) = match inner.split_once('|') {
            Some((target, alias)) => (target, Some(alias)),
            None => (inner, None),
        };
        let (name, heading) = match target.split_once('#') {
            Some((name, heading)) => (name, Some(heading)),
            None => (target, None),
        };
        if !link_target_matches(name, from) {
            return caps[0].to_string();
        }
        rewritten += 1;

        let trimmed = name.trim();
        let mut new_name = if trimmed.contains('/') {
            without_md(to)
        } else {
            vaultward_core::paths::note_stem(to)
        };
        if trimmed.ends_with(".md") {
            new_name.push_str(".md");
        }
        let mut link = format!("[[{new_name}");
        if let Some(heading) = heading {
            link.push('#');
            link.push_str(heading);
        }
        if let Some(alias) = alias {
            link.push('|');
            link.push_str(alias);
        }
        link.push_str("]]");
        link
    });
    (out.into_owned(), rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_at_end_adds_blank_line() {
        let out = insert_block("# Title\nbody\n", "## Related\n<!-- r1 -->\n- [[y]]", &Placement::End).unwrap();
        assert_eq!(out, "# Title\nbody\n\n## Related\n<!-- r1 -->\n- [[y]]\n");
        assert_eq!(insert_block("", "x", &Placement::End).unwrap(), "x\n");
    }

    #[test]
    fn append_after_unique_heading() {
        let placement = Placement::AfterHeading {
            heading: "## Links".to_string(),
        };
        let out = insert_block("# T\n## Links\nold\n", "<!-- a -->\nnew\n", &placement).unwrap();
        assert_eq!(out, "# T\n## Links\n<!-- a -->\nnew\nold\n");
    }

    #[test]
    fn heading_must_be_unique_and_present() {
        let placement = Placement::AfterHeading {
            heading: "## Links".to_string(),
        };
        assert!(matches!(
            insert_block("## Links\n## Links\n", "x\n", &placement),
            Err(EditError::AmbiguousAnchor(_))
        ));
        assert!(matches!(
            insert_block("# Other\n", "x\n", &placement),
            Err(EditError::MissingAnchor(_))
        ));
    }

    #[test]
    fn strip_candidates_recover_base() {
        let base = "body";
        let block = "<!-- a -->\nx\n";
        let applied = insert_block(base, block, &Placement::End).unwrap();
        assert!(strip_block_candidates(&applied, block).contains(&base.to_string()));
        let twice = format!("{applied}{block}");
        assert!(strip_block_candidates(&twice, block).is_empty());
    }

    #[test]
    fn frontmatter_merge_only_adds_missing_keys() {
        let mut fields = BTreeMap::new();
        fields.insert("tags".to_string(), vec!["x".to_string()]);
        fields.insert("aliases".to_string(), vec!["A".to_string(), "B".to_string()]);
        let content = "---\ntags: [old]\n---\nbody\n";
        let out = merge_frontmatter(content, &fields).unwrap().unwrap();
        assert_eq!(out, "---\ntags: [old]\naliases:\n  - A\n  - B\n---\nbody\n");
        assert_eq!(merge_frontmatter(&out, &fields).unwrap(), None);
    }

    #[test]
    fn frontmatter_created_when_absent() {
        let mut fields = BTreeMap::new();
        fields.insert("tags".to_string(), vec![]);
        let out = merge_frontmatter("body\n", &fields).unwrap().unwrap();
        assert_eq!(out, "---\ntags: []\n---\nbody\n");
    }

    #[test]
    fn unclosed_frontmatter_is_malformed() {
        let mut fields = BTreeMap::new();
        fields.insert("tags".to_string(), vec![]);
        assert!(matches!(
            merge_frontmatter("---\ntags: []\nbody\n", &fields),
            Err(EditError::MalformedStructure(_))
        ));
    }

    #[test]
    fn rewrites_links_keeping_alias_and_heading() {
        let content = "see [[a]], [[a|alias]], [[a#Top]], [[a.md]], [[dir/a]] and [[ab]]";
        let (out, count) = rewrite_links(content, Path::new("dir/a.md"), Path::new("dir/b.md"));
        assert_eq!(count, 5);
        assert_eq!(out, "see [[b]], [[b|alias]], [[b#Top]], [[b.md]], [[dir/b]] and [[ab]]");
        assert_eq!(count_links_to(content, Path::new("dir/a.md")), 5);
        assert_eq!(count_links_to(&out, Path::new("dir/a.md")), 0);
    }
}
