//! The execution request every adapter accepts

use crate::command::shell_escape;
use crate::options::AdapterOptions;
use futures::io::AsyncRead;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

/// Where the command's stdin comes from
#[derive(Default)]
pub enum StdinSource {
    /// No stdin; the command sees an empty, closed stream
    #[default]
    None,
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// An async reader copied to the command until EOF
    Reader(Pin<Box<dyn AsyncRead + Send>>),
}

impl StdinSource {
    /// Whether there is anything to feed
    pub fn is_none(&self) -> bool {
        matches!(self, StdinSource::None)
    }

    /// Wrap an async reader
    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        StdinSource::Reader(Box::pin(reader))
    }
}

impl fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdinSource::None => f.write_str("None"),
            StdinSource::Text(text) => write!(f, "Text({} bytes)", text.len()),
            StdinSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            StdinSource::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl From<&str> for StdinSource {
    fn from(text: &str) -> Self {
        StdinSource::Text(text.to_string())
    }
}

impl From<String> for StdinSource {
    fn from(text: String) -> Self {
        StdinSource::Text(text)
    }
}

impl From<Vec<u8>> for StdinSource {
    fn from(bytes: Vec<u8>) -> Self {
        StdinSource::Bytes(bytes)
    }
}

/// What happens to a command's stdout or stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Capture into the result
    #[default]
    Pipe,
    /// Pass through to this process' own stream; nothing is captured
    Inherit,
}

/// A command to run on one of the backends
pub struct ExecutionRequest {
    /// Command string (shell mode) or program name
    pub command: String,
    /// Ordered arguments
    pub args: Vec<String>,
    /// Run through `<shell> -c`
    pub shell: bool,
    /// Input source
    pub stdin: StdinSource,
    /// stdout disposition
    pub stdout: OutputMode,
    /// stderr disposition
    pub stderr: OutputMode,
    /// Working directory on the target
    pub cwd: Option<String>,
    /// Environment variables on the target
    pub env: BTreeMap<String, String>,
    /// Time bound in milliseconds
    pub timeout_ms: Option<u64>,
    /// Per-call failure policy override
    pub nothrow: Option<bool>,
    /// Backend selection; `None` means the engine's default adapter
    pub adapter_options: Option<AdapterOptions>,
}

impl ExecutionRequest {
    /// A shell command (`shell = true`)
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            shell: true,
            stdin: StdinSource::None,
            stdout: OutputMode::Pipe,
            stderr: OutputMode::Pipe,
            cwd: None,
            env: BTreeMap::new(),
            timeout_ms: None,
            nothrow: None,
            adapter_options: None,
        }
    }

    /// A program with an argument vector (`shell = false`)
    pub fn program<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut request = Self::new(program);
        request.shell = false;
        request.args = args.into_iter().map(Into::into).collect();
        request
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set shell mode
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Set the stdin source
    pub fn stdin(mut self, stdin: impl Into<StdinSource>) -> Self {
        self.stdin = stdin.into();
        self
    }

    /// Feed stdin from an async reader
    pub fn stdin_reader<R>(mut self, reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        self.stdin = StdinSource::reader(reader);
        self
    }

    /// Set the stdout disposition
    pub fn stdout(mut self, mode: OutputMode) -> Self {
        self.stdout = mode;
        self
    }

    /// Set the stderr disposition
    pub fn stderr(mut self, mode: OutputMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the time bound
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the time bound in milliseconds
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Override the failure policy for this call
    pub fn nothrow(mut self, nothrow: bool) -> Self {
        self.nothrow = Some(nothrow);
        self
    }

    /// Select the backend
    pub fn with_adapter(mut self, options: AdapterOptions) -> Self {
        self.adapter_options = Some(options);
        self
    }

    /// The literal command as it would be typed into a shell
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            return self.command.clone();
        }
        let head = if self.shell {
            self.command.clone()
        } else {
            shell_escape(&self.command)
        };
        let args: Vec<String> = self.args.iter().map(|a| shell_escape(a)).collect();
        format!("{} {}", head, args.join(" "))
    }

    /// The argument vector to run when no shell is involved
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("shell", &self.shell)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("cwd", &self.cwd)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("timeout_ms", &self.timeout_ms)
            .field("nothrow", &self.nothrow)
            .field("adapter", &self.adapter_options.as_ref().map(|o| o.kind()))
            .finish()
    }
}
