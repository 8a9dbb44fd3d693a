//! Log handling: secret redaction and captured-log tails.

mod redact;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub use redact::{SecretRedactor, mask_token};

/// Read the last `max_lines` lines of a log file.
///
/// Invalid UTF-8 is replaced rather than treated as an error, since worker
/// output is arbitrary bytes.
///
/// # Errors
///
/// Returns an error message if the file cannot be opened or read.
pub fn read_tail(path: &Path, max_lines: usize) -> Result<String, String> {
    let file = File::open(path).map_err(|err| format!("open {}: {err}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut lines = std::collections::VecDeque::with_capacity(max_lines + 1);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|err| format!("read {}: {err}", path.display()))?;
        if read == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        lines.push_back(line.trim_end_matches(['\n', '\r']).to_string());
        if lines.len() > max_lines {
            let _ = lines.pop_front();
        }
    }
    Ok(Vec::from(lines).join("\n"))
}

/// Best-effort redacted tail for diagnostics; never fails.
#[must_use]
pub fn diagnostic_tail(path: &Path, max_lines: usize, redactor: &SecretRedactor) -> String {
    match read_tail(path, max_lines) {
        Ok(tail) if tail.is_empty() => format!("({} is empty)", path.display()),
        Ok(tail) => redactor.redact(&tail).into_owned(),
        Err(err) => format!("(log unavailable: {err})"),
    }
}
