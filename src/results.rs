//! Browsing of the JSON result files the experiment scripts leave under the output root.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultFile {
    /// Name of the task directory directly under the output root.
    pub task_dir: String,
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_utc: Option<String>,
}

impl ResultFile {
    /// `task_dir/file_name`, the form shown in lists.
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.task_dir, self.file_name)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn modified_utc(meta: &std::fs::Metadata) -> Option<String> {
    let modified = meta.modified().ok()?;
    time::OffsetDateTime::from(modified)
        .format(&time::format_description::well_known::Rfc3339)
        .ok()
}

/// Collect `*.json` files one level below each task directory of `output_root`.
///
/// A missing output root is not an error: nothing has been produced yet.
pub fn list_result_files(output_root: &Path) -> Result<Vec<ResultFile>> {
    let entries = match std::fs::read_dir(output_root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("read output root {}", output_root.display()))
        }
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let task_path = entry.path();
        if !task_path.is_dir() {
            continue;
        }
        let task_dir = entry.file_name().to_string_lossy().into_owned();
        let files = match std::fs::read_dir(&task_path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(dir = %task_path.display(), error = %e, "skipping unreadable task directory");
                continue;
            }
        };
        for file in files.flatten() {
            let path = file.path();
            if !is_json(&path) {
                continue;
            }
            let Ok(meta) = file.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            out.push(ResultFile {
                task_dir: task_dir.clone(),
                file_name: file.file_name().to_string_lossy().into_owned(),
                path,
                size_bytes: meta.len(),
                modified_utc: modified_utc(&meta),
            });
        }
    }

    out.sort_by(|a, b| {
        a.task_dir
            .cmp(&b.task_dir)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });
    Ok(out)
}

/// Parse one result file.
pub fn load_result(path: &Path) -> Result<serde_json::Value> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse JSON in {}", path.display()))
}

fn is_plain_name(s: &str) -> bool {
    let mut comps = Path::new(s).components();
    matches!((comps.next(), comps.next()), (Some(Component::Normal(_)), None))
}

/// Map a `task/file` pair from a client onto a path inside `output_root`.
pub fn resolve_result_path(output_root: &Path, task_dir: &str, file_name: &str) -> Result<PathBuf> {
    if !is_plain_name(task_dir) || !is_plain_name(file_name) {
        bail!("invalid result path component");
    }
    let path = output_root.join(task_dir).join(file_name);
    if !is_json(&path) {
        bail!("only .json result files can be opened");
    }
    // Symlinks could still point elsewhere; compare canonical forms when the file exists.
    if let (Ok(root), Ok(real)) = (output_root.canonicalize(), path.canonicalize()) {
        if !real.starts_with(&root) {
            bail!("result path escapes the output root");
        }
    }
    Ok(path)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum SectionBody {
    Json(String),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultSection {
    pub title: Option<String>,
    pub body: SectionBody,
}

fn body_for(value: &serde_json::Value) -> SectionBody {
    match value {
        serde_json::Value::Object(_) | serde_json::Value::Array(_) => SectionBody::Json(
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        ),
        serde_json::Value::String(s) => SectionBody::Text(s.clone()),
        other => SectionBody::Text(other.to_string()),
    }
}

/// Split a result document into titled sections for display.
///
/// Top-level object keys become sections; nested structures are shown as
/// pretty JSON and scalars as plain text.
pub fn sections(value: &serde_json::Value) -> Vec<ResultSection> {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| ResultSection {
                title: Some(k.clone()),
                body: body_for(v),
            })
            .collect(),
        other => vec![ResultSection {
            title: None,
            body: body_for(other),
        }],
    }
}

/// Render sections as plain lines for terminal output.
pub fn section_lines(sections: &[ResultSection]) -> Vec<String> {
    let mut lines = Vec::new();
    for s in sections {
        if let Some(t) = &s.title {
            lines.push(format!("{t}:"));
        }
        let body = match &s.body {
            SectionBody::Json(b) | SectionBody::Text(b) => b,
        };
        lines.extend(body.lines().map(|l| format!("  {l}")));
        lines.push(String::new());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn lists_json_files_one_level_below_task_dirs() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("tabmwp/b.json"), "{}");
        write(&root.path().join("scienceqa/z.json"), "{}");
        write(&root.path().join("scienceqa/a.json"), "{}");
        write(&root.path().join("scienceqa/notes.txt"), "x");
        write(&root.path().join("scienceqa/nested/deep.json"), "{}");
        write(&root.path().join("top-level.json"), "{}");

        let files = list_result_files(root.path()).unwrap();
        let names: Vec<_> = files.iter().map(ResultFile::display_name).collect();
        assert_eq!(names, ["scienceqa/a.json", "scienceqa/z.json", "tabmwp/b.json"]);
        assert_eq!(files[0].size_bytes, 2);
        assert!(files[0].modified_utc.is_some());
    }

    #[test]
    fn missing_root_lists_nothing() {
        let root = tempfile::tempdir().unwrap();
        let files = list_result_files(&root.path().join("absent")).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let root = tempfile::tempdir().unwrap();
        let p = root.path().join("scienceqa/broken.json");
        write(&p, "{not json");
        let err = load_result(&p).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));

        write(&p, r#"{"acc": 91.2}"#);
        assert_eq!(load_result(&p).unwrap(), json!({"acc": 91.2}));
    }

    #[test]
    fn resolve_rejects_traversal_and_non_json() {
        let root = tempfile::tempdir().unwrap();
        assert!(resolve_result_path(root.path(), "..", "x.json").is_err());
        assert!(resolve_result_path(root.path(), "scienceqa", "../../etc/passwd").is_err());
        assert!(resolve_result_path(root.path(), "scienceqa", "/abs.json").is_err());
        assert!(resolve_result_path(root.path(), "scienceqa", "run.log").is_err());
        let ok = resolve_result_path(root.path(), "scienceqa", "a.json").unwrap();
        assert_eq!(ok, root.path().join("scienceqa").join("a.json"));
    }

    #[test]
    fn object_keys_become_sections() {
        let v = json!({"acc": 88.5, "args": {"model": "cot"}, "note": "done", "ids": [1, 2]});
        let secs = sections(&v);
        assert_eq!(secs.len(), 4);
        let find = |k: &str| secs.iter().find(|s| s.title.as_deref() == Some(k)).unwrap();
        assert_eq!(find("acc").body, SectionBody::Text("88.5".into()));
        assert_eq!(find("note").body, SectionBody::Text("done".into()));
        assert!(matches!(&find("args").body, SectionBody::Json(b) if b.contains("\"model\": \"cot\"")));
        assert!(matches!(find("ids").body, SectionBody::Json(_)));
    }

    #[test]
    fn non_object_is_a_single_untitled_section() {
        let secs = sections(&json!("plain"));
        assert_eq!(
            secs,
            vec![ResultSection {
                title: None,
                body: SectionBody::Text("plain".into())
            }]
        );
        let lines = section_lines(&sections(&json!({"k": 1})));
        assert_eq!(lines, ["k:", "  1", ""]);
    }
}
