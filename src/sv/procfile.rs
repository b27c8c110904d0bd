use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;

/// A Procfile is a YAML mapping of process name to shell command.
/// Declaration order is preserved so registration order is deterministic.
pub type Procfile = IndexMap<String, String>;

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| {
        Regex::new("^[A-Za-z]+[A-Za-z0-9_-]+$").expect("valid process-name regex")
    })
}

pub fn is_valid_name(name: &str) -> bool {
    name_re().is_match(name)
}

pub fn validate(procfile: &Procfile) -> anyhow::Result<()> {
    for name in procfile.keys() {
        anyhow::ensure!(
            is_valid_name(name),
            "invalid Procfile format, process name must be consist of 'a-z A-Z 0-9 - _'"
        );
    }
    Ok(())
}

pub fn load(path: &Path) -> anyhow::Result<Procfile> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read Procfile {}: {e}", path.display()))?;
    let procfile: Procfile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse Procfile {}: {e}", path.display()))?;
    validate(&procfile)?;
    Ok(procfile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_in_declaration_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Procfile");
        fs::write(&path, "web: sleep 30\nworker: sleep 30\nzz-last: sleep 1\n").unwrap();
        let pf = load(&path).unwrap();
        let names: Vec<_> = pf.keys().cloned().collect();
        assert_eq!(names, vec!["web", "worker", "zz-last"]);
        assert_eq!(pf.get("web").map(String::as_str), Some("sleep 30"));
    }

    #[test]
    fn name_rule() {
        assert!(is_valid_name("web"));
        assert!(is_valid_name("worker-1"));
        assert!(is_valid_name("Queue_b2"));
        assert!(!is_valid_name("w"));
        assert!(!is_valid_name("1worker"));
        assert!(!is_valid_name("bad name"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn invalid_name_fails_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Procfile");
        fs::write(&path, "9bad: sleep 1\n").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn missing_file_errors() {
        assert!(load(Path::new("/nonexistent/Procfile")).is_err());
    }
}
