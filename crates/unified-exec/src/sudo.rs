//! Sudo privilege escalation for remote command strings
//!
//! Three ways of getting the password to sudo:
//!
//! - `stdin`: `sudo -S`; the password is written to the command's stdin
//!   before any caller input.
//! - `askpass`: a helper script holding the password is written to a remote
//!   temp file and referenced through `SUDO_ASKPASS`; it is removed once
//!   sudo returns.
//! - `secure-askpass`: the helper script holds no secret. The password
//!   travels as the first line of stdin, is read into an exported variable
//!   and echoed by the helper when sudo asks for it.
//!
//! Without a password, sudo runs non-interactively (`-n`) so a missing
//! sudoers rule surfaces as an ordinary non-zero exit instead of a hang.

use crate::command::{join_shell, shell_quote};
use crate::options::{SudoMethod, SudoOptions};
use std::time::Duration;

/// Common sudo failure diagnostics
pub const SUDO_FAILURE_PATTERNS: &[&str] = &[
    "sorry, try again",
    "incorrect password",
    "authentication failure",
    "a password is required",
    "no password was provided",
    "is not in the sudoers file",
];

const SECRET_VAR: &str = "UNIFIED_EXEC_SUDO_SECRET";
const HELPER_VAR: &str = "_ue_askpass";

/// A command string after sudo wrapping, plus what must be fed to it
#[derive(Clone, PartialEq, Eq)]
pub struct SudoWrap {
    /// The command to send to the remote shell
    pub command: String,
    /// Bytes written to stdin before the caller's input
    pub stdin_prefix: Option<Vec<u8>>,
    /// Prompt to wait for on stderr before writing `stdin_prefix`
    pub prompt: Option<String>,
    /// Bound on the wait for `prompt`
    pub prompt_timeout: Duration,
}

impl std::fmt::Debug for SudoWrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SudoWrap")
            .field("command", &self.command)
            .field("stdin_prefix", &self.stdin_prefix.as_ref().map(|_| "[REDACTED]"))
            .field("prompt", &self.prompt)
            .finish()
    }
}

impl SudoWrap {
    /// No escalation
    pub fn none(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin_prefix: None,
            prompt: None,
            prompt_timeout: Duration::ZERO,
        }
    }

    /// Wrap `inner` per `options`; returns `inner` unchanged when sudo is disabled
    pub fn apply(options: &SudoOptions, inner: &str) -> Self {
        if !options.enabled {
            return Self::none(inner);
        }
        let prompt_timeout = Duration::from_millis(options.prompt_timeout_ms);
        let quoted_inner = shell_quote(inner);

        let Some(password) = options.password.as_ref() else {
            return Self::none(format!("sudo -n sh -c {}", quoted_inner));
        };
        let mut secret_line = password.expose().as_bytes().to_vec();
        secret_line.push(b'\n');

        match options.method {
            SudoMethod::Stdin => {
                let prompt = options.prompt.clone().filter(|p| !p.is_empty());
                Self {
                    command: format!(
                        "sudo -k -S -p {} sh -c {}",
                        shell_quote(prompt.as_deref().unwrap_or("")),
                        quoted_inner
                    ),
                    stdin_prefix: Some(secret_line),
                    prompt,
                    prompt_timeout,
                }
            }
            SudoMethod::Askpass => {
                let helper = format!("#!/bin/sh\nprintf '%s\\n' {}\n", shell_quote(password.expose()));
                Self {
                    command: askpass_script(&helper, &quoted_inner, false),
                    stdin_prefix: None,
                    prompt: None,
                    prompt_timeout,
                }
            }
            SudoMethod::SecureAskpass => {
                let helper = format!("#!/bin/sh\nprintf '%s\\n' \"${}\"\n", SECRET_VAR);
                Self {
                    command: askpass_script(&helper, &quoted_inner, true),
                    stdin_prefix: Some(secret_line),
                    prompt: None,
                    prompt_timeout,
                }
            }
        }
    }

    /// Remove sudo's prompt from captured stderr
    pub fn clean_stderr(&self, stderr: String) -> String {
        match &self.prompt {
            Some(prompt) if stderr.contains(prompt.as_str()) => stderr.replace(prompt.as_str(), ""),
            _ => stderr,
        }
    }
}

fn askpass_script(helper: &str, quoted_inner: &str, read_secret: bool) -> String {
    let mut script = String::new();
    if read_secret {
        script.push_str(&format!("IFS= read -r {0}; export {0}; ", SECRET_VAR));
    }
    script.push_str(&format!(
        "{h}=$(mktemp) || exit 1; \
         printf '%s' {helper} > \"${h}\"; \
         chmod 700 \"${h}\"; \
         SUDO_ASKPASS=\"${h}\" sudo -k -A sh -c {inner}; \
         _ue_rc=$?; rm -f \"${h}\"; exit $_ue_rc",
        h = HELPER_VAR,
        helper = shell_quote(helper),
        inner = quoted_inner,
    ));
    join_shell(["sh", "-c", script.as_str()])
}

/// Whether stderr looks like a sudo authentication failure
pub fn is_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("sudo") && SUDO_FAILURE_PATTERNS.iter().any(|p| lower.contains(p))
}
