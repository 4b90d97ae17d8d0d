use crate::config::Config;
use crate::platform::shell_quote;
use crate::utils::kill_log::KillLog;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Matchable form of a start command: ordered substring patterns to probe
/// the process table with, plus an optional working-directory filter.
/// Derived fresh for every kill attempt and discarded afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub patterns: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// Shell function body lines starting with one of these are scaffolding,
/// not the server process itself.
const FLOW_KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "for", "while", "until", "do", "done", "case", "esac",
    "return", "local", "set", "shift", "trap", "break", "continue", "exit",
];

/// Best-effort heuristic for setup/bootstrap lines inside shell functions.
/// A fixed keyword list, not a shell parser; lines mentioning these are
/// assumed to prepare the environment rather than run the server.
const SETUP_KEYWORDS: &[&str] = &["install", "setup", "bootstrap", "migrate", "migration"];

pub struct CommandResolver {
    config: Arc<Config>,
    log: Arc<dyn KillLog>,
    cd_prefix: Regex,
    env_assign: Regex,
    segment_split: Regex,
}

impl CommandResolver {
    pub fn new(config: Arc<Config>, log: Arc<dyn KillLog>) -> Self {
        Self {
            config,
            log,
            cd_prefix: Regex::new(r#"^cd\s+(?:"([^"]+)"|'([^']+)'|([^\s;&]+))\s*(?:&&|;)\s*(.+)$"#)
                .expect("valid cd-prefix regex"),
            env_assign: Regex::new(r"^(?:[A-Za-z_][A-Za-z0-9_]*=\S*\s+)+")
                .expect("valid env-assignment regex"),
            segment_split: Regex::new(r"\s*(?:&&|;)\s*").expect("valid segment regex"),
        }
    }

    /// Reduces a free-form, human-authored start command to match targets.
    /// Every step is best-effort: alias/function introspection that fails or
    /// times out falls back to the literal string, never to an error.
    #[instrument(skip(self))]
    pub async fn resolve(&self, start_command: &str) -> CommandSpec {
        let trimmed = start_command.trim();
        if trimmed.is_empty() {
            return CommandSpec {
                patterns: Vec::new(),
                cwd: None,
            };
        }

        let (mut cwd, mut working) = self.strip_cd_prefix(trimmed);

        // A single bare word may be an alias or shell function rather than
        // a binary; ask the user's shell what it means.
        if !working.contains(char::is_whitespace) {
            if let Some(expansion) = self.resolve_bare_word(&working).await {
                self.note(format!("resolved '{}' to '{}'", working, expansion))
                    .await;
                let (expansion_cwd, expansion_working) = self.strip_cd_prefix(&expansion);
                cwd = expansion_cwd.or(cwd);
                working = expansion_working;
            }
        }

        CommandSpec {
            patterns: self.candidate_patterns(&working),
            cwd,
        }
    }

    /// `cd <path> && <rest>` (or `; <rest>`) becomes a directory hint plus
    /// the command that actually runs. Quotes around the path are stripped,
    /// tildes expanded.
    pub(crate) fn strip_cd_prefix(&self, command: &str) -> (Option<PathBuf>, String) {
        if let Some(caps) = self.cd_prefix.captures(command.trim()) {
            let raw_path = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or("");
            let rest = caps.get(4).map(|m| m.as_str().trim()).unwrap_or("");
            if !raw_path.is_empty() && !rest.is_empty() {
                let hint = PathBuf::from(shellexpand::tilde(raw_path).as_ref());
                return (Some(hint), rest.to_string());
            }
        }
        (None, command.trim().to_string())
    }

    /// Candidate order is the whole command first, then segments of a
    /// compound chain in reverse: shells run left to right, so the last
    /// segment is the one most likely still in the foreground.
    pub(crate) fn candidate_patterns(&self, working: &str) -> Vec<String> {
        let mut patterns = vec![working.to_string()];
        let segments: Vec<String> = self
            .segment_split
            .split(working)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if segments.len() > 1 {
            for segment in segments.iter().rev() {
                if !patterns.contains(segment) {
                    patterns.push(segment.clone());
                }
            }
        }
        patterns
    }

    async fn resolve_bare_word(&self, word: &str) -> Option<String> {
        if cfg!(windows) {
            // Alias/function introspection is an interactive-unix-shell
            // concern; on Windows the bare word is taken literally.
            return None;
        }
        let shell = self.login_shell();
        let report = self
            .shell_query(&shell, &format!("type {}", shell_quote(word)))
            .await?;

        if let Some(expansion) = parse_alias_report(&report) {
            return Some(expansion);
        }

        if report.contains("is a function") || report.contains("is a shell function") {
            let script = format!(
                "declare -f {} 2>/dev/null || functions {}",
                shell_quote(word),
                shell_quote(word)
            );
            let body = self.shell_query(&shell, &script).await?;
            let lines = self.filter_function_body(&body);
            if lines.is_empty() {
                self.note(format!(
                    "function '{}' has no executable-looking line; using it literally",
                    word
                ))
                .await;
                return None;
            }
            return Some(lines.join(" && "));
        }

        debug!(word = %word, "shell reports neither alias nor function");
        None
    }

    /// Keeps only the lines of a shell function body that plausibly start
    /// the server: drops directory changes, exports/sourcing, flow control,
    /// comments, braces, nested declarations and setup-looking steps, and
    /// strips leading `VAR=value` prefixes (they never appear in a process's
    /// argv). Documented heuristic, not a parser.
    pub(crate) fn filter_function_body(&self, body: &str) -> Vec<String> {
        let mut kept = Vec::new();
        for raw in body.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line
                .chars()
                .all(|c| c == '{' || c == '}' || c == ';' || c.is_whitespace())
            {
                continue;
            }
            if line.contains("()") || line.starts_with("function ") {
                continue;
            }

            let stripped = self.env_assign.replace(line, "").trim().to_string();
            let lowered = stripped.to_lowercase();
            let first = stripped.split_whitespace().next().unwrap_or("");
            if first.is_empty() {
                continue;
            }
            if first == "cd" || first == "export" || first == "source" || first == "." {
                continue;
            }
            if FLOW_KEYWORDS.contains(&first) {
                continue;
            }
            if SETUP_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                continue;
            }

            kept.push(stripped.trim_end_matches(';').trim().to_string());
        }
        kept
    }

    fn login_shell(&self) -> String {
        self.config
            .default_shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    /// Runs one short script in the user's interactive shell. Bounded by a
    /// timeout so a hung shell (slow rc files, prompts) cannot stall the
    /// caller; every failure resolves to None.
    async fn shell_query(&self, shell: &str, script: &str) -> Option<String> {
        let mut cmd = TokioCommand::new(shell);
        cmd.arg("-i").arg("-c").arg(script);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(shell = %shell, script = %script, "Querying shell");
        match timeout(self.config.shell_resolve_timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let text = if stdout.trim().is_empty() {
                    // `type` reports unknown words on stderr in some shells.
                    String::from_utf8_lossy(&output.stderr).into_owned()
                } else {
                    stdout.into_owned()
                };
                let trimmed = text.trim().to_string();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed)
                }
            }
            Ok(Err(e)) => {
                warn!(shell = %shell, error = %e, "Failed to spawn shell for resolution");
                self.note(format!("shell query via {} failed: {}", shell, e)).await;
                None
            }
            Err(_) => {
                self.note(format!(
                    "shell query via {} timed out after {:?}",
                    shell, self.config.shell_resolve_timeout
                ))
                .await;
                None
            }
        }
    }

    async fn note(&self, line: String) {
        debug!("{}", line);
        self.log.log(&line).await;
    }
}

/// Extracts the expansion from a `type` report, covering both observed
/// formats: bash's `X is aliased to 'expansion'` and zsh's
/// `X is an alias for expansion`.
fn parse_alias_report(report: &str) -> Option<String> {
    for line in report.lines() {
        if let Some(idx) = line.find(" is aliased to ") {
            let raw = line[idx + " is aliased to ".len()..].trim();
            let unquoted = raw
                .trim_start_matches(|c| c == '`' || c == '\'')
                .trim_end_matches('\'')
                .trim();
            if !unquoted.is_empty() {
                return Some(unquoted.to_string());
            }
        }
        if let Some(idx) = line.find(" is an alias for ") {
            let raw = line[idx + " is an alias for ".len()..].trim();
            if !raw.is_empty() {
                return Some(raw.to_string());
            }
        }
    }
    None
}
