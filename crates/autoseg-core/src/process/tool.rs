//! One-shot external tool invocations.
//!
//! Migration, extraction, and the command-backed object store all run a
//! program to completion and only care about its exit status and the tail
//! of what it printed.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tracing::debug;

/// Lines of tool output kept for error messages.
const OUTPUT_TAIL_LINES: usize = 20;

/// Result of a finished tool run.
#[derive(Debug)]
pub struct ToolOutput {
    /// Exit status.
    pub status: ExitStatus,
    /// Tail of stdout followed by stderr.
    pub output: String,
}

impl ToolOutput {
    /// Whether the tool exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit status rendered for messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.status.to_string()
    }
}

/// Run `program` with `args` to completion, capturing its output.
///
/// # Errors
///
/// Returns the spawn or wait error; a non-zero exit is not an error here.
pub async fn run_tool(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &[(String, String)],
) -> std::io::Result<ToolOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }

    debug!(program, ?args, "running tool");
    let out = cmd.output().await?;
    let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&out.stderr));

    Ok(ToolOutput {
        status: out.status,
        output: tail_lines(&combined, OUTPUT_TAIL_LINES),
    })
}

fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Resolve a program the way `execvp` would: paths are checked directly,
/// bare names are searched on `PATH`.
#[must_use]
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }

    let path_var = std::env::var_os("PATH")?;
    for segment in std::env::split_paths(&path_var) {
        let candidate = segment.join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// Substitute `{name}` placeholders in an argv template.
///
/// Each argument is scanned once, left to right, so placeholder text inside
/// a substituted value is left alone. Unknown placeholders stay verbatim.
#[must_use]
pub fn render_args(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template.iter().map(|arg| render_one(arg, vars)).collect()
}

fn render_one(arg: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value, close))
        });
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            },
            None => {
                out.push('{');
                rest = after;
            },
        }
    }
    out.push_str(rest);
    out
}
