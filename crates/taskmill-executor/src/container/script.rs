//! The files a container run is built from.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

pub const ENTRY_SCRIPT: &str = "execute.py";
pub const PAYLOAD_FILE: &str = "payload.json";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const MOUNT_POINT: &str = "/app";

/// Runs the submitted code from `payload.json`, calls the entry point and
/// prints exactly one JSON line describing the outcome.
const ENTRY_SOURCE: &str = r#"import json
import sys
import traceback


def _emit(outcome):
    sys.stdout.write(json.dumps(outcome, ensure_ascii=False, default=repr) + "\n")
    sys.stdout.flush()


def _main():
    with open("/app/payload.json", encoding="utf-8") as fh:
        payload = json.load(fh)
    namespace = {"__name__": "__task__"}
    try:
        exec(compile(payload["code"], "<task>", "exec"), namespace)
        func = namespace.get(payload["function_name"])
        if not callable(func):
            _emit({"success": False, "error": "function '%s' not found in code" % payload["function_name"]})
            return
        result = func(*payload["args"], **payload["kwargs"])
        _emit({"success": True, "result": result})
    except Exception as exc:
        _emit({"success": False, "error": "%s: %s" % (type(exc).__name__, exc), "traceback": traceback.format_exc()})


_main()
"#;

/// Package requirement lines accepted for installation: a name optionally
/// followed by extras and version specifiers. Anything that could smuggle
/// pip options or shell syntax is refused.
fn requirement_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-\[\],<>=!~ ]*$").ok())
        .as_ref()
}

/// Check one requirement line, returning why it is refused.
pub fn validate_requirement(line: &str) -> Result<(), String> {
    let line = line.trim();
    if line.is_empty() {
        return Err("empty requirement".to_string());
    }
    let well_formed = requirement_pattern().is_some_and(|re| re.is_match(line));
    if line.len() > 200 || !well_formed {
        return Err(format!("invalid requirement: {line}"));
    }
    Ok(())
}

pub fn validate_requirements(lines: &[String]) -> Result<(), String> {
    lines.iter().try_for_each(|l| validate_requirement(l))
}

/// Write the entry script, the payload and the optional requirements file.
pub fn write_files(
    dir: &Path,
    code: &str,
    function_name: &str,
    args: &[Value],
    kwargs: &Map<String, Value>,
    requirements: &[String],
) -> std::io::Result<()> {
    std::fs::write(dir.join(ENTRY_SCRIPT), ENTRY_SOURCE)?;
    let payload = json!({
        "code": code,
        "function_name": function_name,
        "args": args,
        "kwargs": kwargs,
    });
    std::fs::write(dir.join(PAYLOAD_FILE), payload.to_string())?;
    if !requirements.is_empty() {
        let mut body = requirements
            .iter()
            .map(|r| r.trim())
            .collect::<Vec<_>>()
            .join("\n");
        body.push('\n');
        std::fs::write(dir.join(REQUIREMENTS_FILE), body)?;
    }
    Ok(())
}

/// The container command. Dependencies are installed into a writable
/// target outside the read-only mount before the script runs.
pub fn command(has_requirements: bool, index_url: Option<&str>) -> Vec<String> {
    let run = format!("python {MOUNT_POINT}/{ENTRY_SCRIPT}");
    if !has_requirements {
        return vec!["python".to_string(), format!("{MOUNT_POINT}/{ENTRY_SCRIPT}")];
    }
    let index = index_url
        .map(|url| format!(" --index-url '{}'", url.replace('\'', "")))
        .unwrap_or_default();
    let install = format!(
        "pip install --quiet --disable-pip-version-check --no-cache-dir --target /tmp/deps{index} -r {MOUNT_POINT}/{REQUIREMENTS_FILE}"
    );
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("{install} && PYTHONPATH=/tmp/deps {run}"),
    ]
}

/// Extract the structured outcome from captured output: the whole output as
/// one JSON object, else the first line that parses as one.
pub fn parse_outcome(output: &str) -> Option<Map<String, Value>> {
    let trimmed = output.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{') && line.ends_with('}'))
        .find_map(|line| match serde_json::from_str(line) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_requirements() {
        for line in ["requests", "pandas>=2.0.0", "uvicorn[standard]==0.30.1", "numpy ~= 1.26"] {
            assert!(validate_requirement(line).is_ok(), "{line}");
        }
    }

    #[test]
    fn refuses_options_and_shell_syntax() {
        for line in ["", "-e git+https://x", "--index-url http://evil", "requests; rm -rf /", "a && b", "$(id)"] {
            assert!(validate_requirement(line).is_err(), "{line}");
        }
    }

    #[test]
    fn command_installs_only_when_needed() {
        assert_eq!(command(false, None), vec!["python", "/app/execute.py"]);
        let with_deps = command(true, Some("https://pypi.example/simple"));
        assert_eq!(with_deps[..2], ["sh", "-c"]);
        assert!(with_deps[2].contains("--index-url 'https://pypi.example/simple'"));
        assert!(with_deps[2].ends_with("python /app/execute.py"));
    }

    #[test]
    fn outcome_is_found_in_noisy_output() {
        let whole = parse_outcome("{\"success\": true, \"result\": 3}\n").unwrap();
        assert_eq!(whole["result"], json!(3));

        let noisy = "Collecting requests\nInstalled\n{\"success\": false, \"error\": \"x\"}\ntrailer";
        assert_eq!(parse_outcome(noisy).unwrap()["error"], json!("x"));

        assert!(parse_outcome("plain text\n{not json}").is_none());
    }

    #[test]
    fn files_are_written() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), "def f(): return 1", "f", &[json!(1)], &Map::new(), &["requests".into()])
            .unwrap();
        let payload: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(PAYLOAD_FILE)).unwrap())
                .unwrap();
        assert_eq!(payload["function_name"], json!("f"));
        assert_eq!(payload["args"], json!([1]));
        assert_eq!(
            std::fs::read_to_string(dir.path().join(REQUIREMENTS_FILE)).unwrap(),
            "requests\n"
        );
        assert!(dir.path().join(ENTRY_SCRIPT).exists());
    }
}
