//! External command execution for git plumbing.
//!
//! Commands are constructed internally and run through a shell because the
//! diff filters pipe through `grep`. A non-zero exit is not an error here:
//! several git invocations legitimately exit non-zero when their output is
//! empty (grep with no match, log with no commits in range), and the
//! pipeline composes over empty output.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

/// Run `cmd` through `sh -c` in `cwd` and return captured stdout.
///
/// On non-zero exit the captured output is still returned and a warning is
/// logged; only failure to spawn the shell propagates as an error.
pub fn run_shell_command(cmd: &str, cwd: &Path) -> Result<String> {
    log::debug!("Command: {}", cmd);

    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        .output()
        .with_context(|| format!("Failed to execute shell command: {}", cmd))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        log::warn!(
            "Non-zero exit code running: {} ({})",
            cmd,
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Split command output into non-empty lines.
pub fn non_empty_lines(output: &str) -> Vec<&str> {
    output.lines().filter(|line| !line.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = run_shell_command("echo hello", Path::new(".")).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn non_zero_exit_returns_output() {
        // grep with no match exits 1; the runner must still return stdout.
        let out = run_shell_command("printf 'a\\nb\\n' | grep z", Path::new(".")).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn runs_in_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("marker.txt"), "x").unwrap();
        let out = run_shell_command("ls", tmp.path()).unwrap();
        assert!(out.contains("marker.txt"));
    }

    #[test]
    fn splits_non_empty_lines() {
        assert_eq!(non_empty_lines("a\n\nb\n"), vec!["a", "b"]);
        assert!(non_empty_lines("").is_empty());
    }
}
