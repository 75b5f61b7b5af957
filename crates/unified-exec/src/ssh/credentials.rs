//! Turning SSH options into ssh client arguments and helper files

use crate::error::{Error, Result};
use crate::options::{AdapterKind, SshOptions};
use crate::command::Command;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempPath;

/// Stable, non-reversible identifier of the credentials in `options`
///
/// Two option sets with the same fingerprint authenticate the same way and
/// may share pooled connections.
pub fn fingerprint(options: &SshOptions) -> String {
    let mut hasher = Sha256::new();
    if let Some(key) = &options.private_key {
        hasher.update(b"key\0");
        hasher.update(key.as_bytes());
    }
    if let Some(path) = &options.identity_file {
        hasher.update(b"\0file\0");
        hasher.update(path.to_string_lossy().as_bytes());
    }
    if let Some(passphrase) = &options.passphrase {
        hasher.update(b"\0passphrase\0");
        hasher.update(passphrase.expose().as_bytes());
    }
    if let Some(password) = &options.password {
        hasher.update(b"\0password\0");
        hasher.update(password.expose().as_bytes());
    }
    let digest = hasher.finalize();
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Credentials materialized on disk for the lifetime of one ssh invocation
///
/// Files are owner-only and removed on drop.
#[derive(Debug)]
pub struct Credentials {
    key_file: Option<TempPath>,
    identity_file: Option<PathBuf>,
    askpass: Option<TempPath>,
    password_auth: bool,
}

impl Credentials {
    /// Write key material and the askpass helper as needed
    pub fn materialize(options: &SshOptions) -> Result<Self> {
        let key_file = match &options.private_key {
            Some(key) => Some(write_private(
                "unified-exec-key-",
                key.as_bytes(),
                false,
            )?),
            None => None,
        };
        let has_key = key_file.is_some() || options.identity_file.is_some();

        let secret = if has_key {
            options.passphrase.as_ref()
        } else {
            options.password.as_ref()
        };
        let askpass = match secret {
            Some(secret) => {
                let script = format!(
                    "#!/bin/sh\nprintf '%s\\n' {}\n",
                    crate::command::shell_quote(secret.expose())
                );
                Some(write_private("unified-exec-askpass-", script.as_bytes(), true)?)
            }
            None => None,
        };

        Ok(Self {
            key_file,
            identity_file: options.identity_file.clone(),
            askpass,
            password_auth: !has_key && options.password.is_some(),
        })
    }

    /// Authentication-related ssh arguments
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let identity = self
            .key_file
            .as_ref()
            .map(|p| p.to_path_buf())
            .or_else(|| self.identity_file.clone());
        if let Some(identity) = identity {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        if self.password_auth {
            args.push("-o".to_string());
            args.push("PreferredAuthentications=password,keyboard-interactive".to_string());
            args.push("-o".to_string());
            args.push("NumberOfPasswordPrompts=1".to_string());
        }
        if self.askpass.is_none() {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        args
    }

    /// Environment that routes passphrase/password prompts to the helper
    pub fn apply_env(&self, command: &mut Command) {
        if let Some(askpass) = &self.askpass {
            command.env("SSH_ASKPASS", askpass.as_os_str());
            command.env("SSH_ASKPASS_REQUIRE", "force");
            command.env("DISPLAY", ":0");
        }
    }
}

fn write_private(prefix: &str, contents: &[u8], executable: bool) -> Result<TempPath> {
    let to_err = |e: std::io::Error| Error::adapter_with(AdapterKind::Ssh, "materialize-credentials", e);
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile()
        .map_err(to_err)?;
    file.write_all(contents).map_err(to_err)?;
    if !contents.ends_with(b"\n") && !executable {
        file.write_all(b"\n").map_err(to_err)?;
    }
    file.flush().map_err(to_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if executable { 0o700 } else { 0o600 };
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(mode))
            .map_err(to_err)?;
    }

    // Closing the handle avoids ETXTBSY when the helper is executed
    Ok(file.into_temp_path())
}
