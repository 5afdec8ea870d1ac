use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn write_bytes(root: &Path, rel_path: &str, bytes: &[u8]) -> Result<()> {
    let path = root.join(rel_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn write_text(root: &Path, rel_path: &str, text: &str) -> Result<()> {
    write_bytes(root, rel_path, text.as_bytes())
}

pub fn write_json<T: serde::Serialize>(root: &Path, rel_path: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serialize {rel_path}"))?;
    write_bytes(root, rel_path, &bytes)
}

pub fn display_path(path: &Path, base: Option<&Path>) -> String {
    if let Some(base) = base {
        if let Ok(relative) = path.strip_prefix(base) {
            return relative.display().to_string();
        }
    }
    path.display().to_string()
}

pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

/// Lowercase, dash-separated form of `title` usable as a directory name.
pub fn slug(title: &str) -> String {
    let mut out = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "api".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_string("héllo", 2), "h");
        assert_eq!(truncate_string("héllo", 3), "hé");
        assert_eq!(truncate_string("abc", 10), "abc");
    }

    #[test]
    fn slugs_are_directory_safe() {
        assert_eq!(slug("Swagger Petstore - OpenAPI 3.0"), "swagger-petstore-openapi-3-0");
        assert_eq!(slug("  !!"), "api");
    }

    #[test]
    fn json_files_create_parent_dirs() {
        let root = tempfile::tempdir().expect("tempdir");
        write_json(root.path(), "a/b/c.json", &serde_json::json!({"k": 1})).expect("write");
        let text = std::fs::read_to_string(root.path().join("a/b/c.json")).expect("read");
        assert!(text.contains("\"k\": 1"), "{text}");
        assert_eq!(
            display_path(&root.path().join("a/b/c.json"), Some(root.path())),
            "a/b/c.json"
        );
    }
}
