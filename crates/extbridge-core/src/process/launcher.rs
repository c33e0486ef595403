//! Process launching for host-spawned agents.
//!
//! A launch resolves a command template such as
//! `"dotnet agent.dll --port {remote-port}"` against a parameter map, splits
//! it into program and arguments, and spawns the child with its output
//! streamed line by line into `tracing`.

use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// What to launch and with which parameters and environment.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Command line with `{name}` placeholders.
    pub command_template: String,
    /// Placeholder values.
    pub params: HashMap<String, String>,
    /// Environment variables added to the child's environment.
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(command_template: impl Into<String>) -> Self {
        Self {
            command_template: command_template.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Substitute every `{name}` in `template` from `params`.
///
/// A placeholder without a value is a launch error. A `{` without a
/// closing `}` is kept literally.
pub fn resolve_template(template: &str, params: &HashMap<String, String>) -> Result<String> {
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|i| open + i) else {
            break;
        };

        let name = &rest[open + 1..close];
        let value = params.get(name).ok_or_else(|| BridgeError::Launch {
            command: template.to_string(),
            message: format!("unresolved placeholder '{{{name}}}'"),
        })?;

        resolved.push_str(&rest[..open]);
        resolved.push_str(value);
        rest = &rest[close + 1..];
    }

    resolved.push_str(rest);
    Ok(resolved)
}

/// Split a command line into program and arguments.
///
/// Whitespace separates arguments; single or double quotes group them.
pub fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    parts.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    let launch_error = |message: &str| BridgeError::Launch {
        command: command.to_string(),
        message: message.to_string(),
    };

    if quote.is_some() {
        return Err(launch_error("unterminated quote"));
    }
    if in_token {
        parts.push(current);
    }

    let mut parts = parts.into_iter();
    let program = parts.next().ok_or_else(|| launch_error("empty command"))?;
    Ok((program, parts.collect()))
}

/// Spawns agent processes.
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Resolve the template and start the process.
    ///
    /// The child is killed when its handle is dropped.
    pub fn launch(spec: &LaunchSpec) -> Result<ProcessHandle> {
        let command_line = resolve_template(&spec.command_template, &spec.params)?;
        let (program, args) = split_command(&command_line)?;

        debug!("Launching {} {:?}", program, args);

        let mut child = Command::new(&program)
            .args(&args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Launch {
                command: command_line.clone(),
                message: e.to_string(),
            })?;

        let pid = child.id().unwrap_or_default();
        info!("Started process {} (pid {})", program, pid);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, pid, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, pid, true));
        }

        Ok(ProcessHandle {
            child,
            pid,
            command: command_line,
        })
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: R, pid: u32, is_stderr: bool) {
    let mut reader = BufReader::new(stream).lines();

    loop {
        match reader.next_line().await {
            Ok(Some(line)) if is_stderr => warn!(pid, "{}", line),
            Ok(Some(line)) => info!(pid, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(pid, "Error reading process output: {}", e);
                break;
            }
        }
    }
}

/// A running child process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    command: String,
}

impl ProcessHandle {
    pub fn id(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the process has already exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Kill the process and wait for it to exit.
    pub async fn kill(&mut self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.child.kill().await?;
        debug!("Killed process {}", self.pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_template() {
        let resolved = resolve_template(
            "agent --host {host} --port {remote-port}",
            &params(&[("host", "127.0.0.1"), ("remote-port", "50000")]),
        )
        .unwrap();
        assert_eq!(resolved, "agent --host 127.0.0.1 --port 50000");

        let literal = resolve_template("echo {unclosed", &HashMap::new()).unwrap();
        assert_eq!(literal, "echo {unclosed");
    }

    #[test]
    fn test_unresolved_placeholder_is_launch_error() {
        let err = resolve_template("agent --port {remote-port}", &HashMap::new()).unwrap_err();
        assert!(matches!(err, BridgeError::Launch { ref message, .. } if message.contains("remote-port")));
    }

    #[test]
    fn test_split_command() {
        let (program, args) =
            split_command(r#""/opt/my agent/run" --name 'two words' -v"#).unwrap();
        assert_eq!(program, "/opt/my agent/run");
        assert_eq!(args, vec!["--name", "two words", "-v"]);

        let (program, args) = split_command("  agent  ").unwrap();
        assert_eq!(program, "agent");
        assert!(args.is_empty());

        assert!(split_command("   ").is_err());
        assert!(split_command("agent \"open").is_err());
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let spec = LaunchSpec::new("/definitely/not/a/real/binary-{n}").with_param("n", "1");
        let err = ProcessLauncher::launch(&spec).unwrap_err();
        assert!(matches!(err, BridgeError::Launch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_and_kill() {
        let spec = LaunchSpec::new("sleep {secs}")
            .with_param("secs", "30")
            .with_env("EXTBRIDGE_TEST", "1");
        let mut handle = ProcessLauncher::launch(&spec).unwrap();

        assert!(handle.id() > 0);
        assert_eq!(handle.command(), "sleep 30");
        assert!(!handle.has_exited());

        handle.kill().await.unwrap();
        assert!(handle.has_exited());
    }
}
