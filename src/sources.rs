//! sources.rs — source-channel list files.
//!
//! One username per line; blank lines and `#` comments ignored; a leading
//! `@` is tolerated and stripped. Lists are deduplicated and sorted so the
//! startup log is stable.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub fn load_channel_list(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading channel list from {}", path.display()))?;
    Ok(parse_channel_list(&content))
}

pub fn parse_channel_list(content: &str) -> Vec<String> {
    let mut set = BTreeSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let name = line.trim_start_matches('@').to_lowercase();
        if !name.is_empty() {
            set.insert(name);
        }
    }
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_blanks_and_at_signs_are_handled() {
        let content = "# arab sources\n@AlertsNow\n\nGazaWire\n  # inline list end\nalertsnow\n";
        let list = parse_channel_list(content);
        assert_eq!(list, vec!["alertsnow".to_string(), "gazawire".to_string()]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_channel_list(&dir.path().join("nope.txt")).unwrap_err();
        assert!(err.to_string().contains("reading channel list"));
    }
}
