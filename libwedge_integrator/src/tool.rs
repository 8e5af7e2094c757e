use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::config::Config;
use super::error::ToolError;

/// Placeholder in a cluster submission command replaced by the log path
pub const LOG_PLACEHOLDER: &str = "{log}";

/// Shared flag used to stop a running tool
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One run of an external program
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub work_dir: PathBuf,
    /// File in work_dir receiving stdout and stderr
    pub log_name: String,
}

impl Invocation {
    pub fn new(program: &str, work_dir: &Path, log_name: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
            work_dir: work_dir.to_path_buf(),
            log_name: log_name.to_string(),
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|a| a.to_string()));
        self
    }

    pub fn stdin(mut self, text: &str) -> Self {
        self.stdin = Some(text.to_string());
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.work_dir.join(&self.log_name)
    }

    /// The program and arguments as a single shell command line
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|a| a.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a finished tool left behind. The exit code is informational only;
/// success is always judged from the log.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub log_path: PathBuf,
    pub log_text: String,
    pub exit_code: Option<i32>,
}

/// Runs an external program to completion
pub trait ToolInvoker: Send + Sync {
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<ToolOutcome, ToolError>;
}

/// The invokers a dataset worker needs: one for the integration program, which
/// may run on a cluster or a RAM node, and one for everything else.
#[derive(Clone)]
pub struct Tools {
    pub integrate: Arc<dyn ToolInvoker>,
    pub local: Arc<dyn ToolInvoker>,
}

impl Tools {
    pub fn from_config(config: &Config) -> Self {
        let poll = config.poll_interval();
        let local: Arc<dyn ToolInvoker> = Arc::new(LocalInvoker::new(poll));
        let integrate: Arc<dyn ToolInvoker> = match config.ram_nodes().first() {
            Some(node) => Arc::new(RamNodeInvoker::new(&node.name, poll)),
            None if config.preferences.use_cluster => Arc::new(ClusterInvoker::new(
                &config.execution.cluster_submit,
                poll,
            )),
            None => local.clone(),
        };
        Self { integrate, local }
    }
}

/// Runs programs as child processes of this one
#[derive(Debug, Clone)]
pub struct LocalInvoker {
    poll_interval: Duration,
}

impl Default for LocalInvoker {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl LocalInvoker {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl ToolInvoker for LocalInvoker {
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<ToolOutcome, ToolError> {
        let exit_code = spawn_and_wait(
            &invocation.program,
            &invocation.args,
            invocation,
            &invocation.log_path(),
            self.poll_interval,
            cancel,
        )?;
        finish(invocation, exit_code)
    }
}

/// Hands programs to a blocking cluster submission command
#[derive(Debug, Clone)]
pub struct ClusterInvoker {
    submit: Vec<String>,
    poll_interval: Duration,
}

impl ClusterInvoker {
    pub fn new(submit: &[String], poll_interval: Duration) -> Self {
        Self {
            submit: submit.to_vec(),
            poll_interval,
        }
    }
}

impl ToolInvoker for ClusterInvoker {
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<ToolOutcome, ToolError> {
        let Some((submit_program, submit_args)) = self.submit.split_first() else {
            return LocalInvoker::new(self.poll_interval).run(invocation, cancel);
        };
        let log_path = invocation.log_path();
        let log_text = log_path.to_string_lossy();
        // When the scheduler writes the tool output itself, keep its own chatter apart
        let scheduler_writes_log = submit_args.iter().any(|a| a.contains(LOG_PLACEHOLDER));
        let mut args: Vec<String> = submit_args
            .iter()
            .map(|a| a.replace(LOG_PLACEHOLDER, &log_text))
            .collect();
        args.push(invocation.program.clone());
        args.extend(invocation.args.iter().cloned());
        let capture = if scheduler_writes_log {
            invocation.work_dir.join(format!("{}.submit", invocation.log_name))
        } else {
            log_path.clone()
        };
        log::debug!("Submitting {} to the cluster", invocation.command_line());
        let exit_code = spawn_and_wait(
            submit_program,
            &args,
            invocation,
            &capture,
            self.poll_interval,
            cancel,
        )?;
        finish(invocation, exit_code)
    }
}

/// Runs programs over ssh on the node holding the first RAM staged images
#[derive(Debug, Clone)]
pub struct RamNodeInvoker {
    node: String,
    poll_interval: Duration,
}

impl RamNodeInvoker {
    pub fn new(node: &str, poll_interval: Duration) -> Self {
        Self {
            node: node.to_string(),
            poll_interval,
        }
    }
}

impl ToolInvoker for RamNodeInvoker {
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<ToolOutcome, ToolError> {
        let remote = format!(
            "cd {} && {}",
            invocation.work_dir.to_string_lossy(),
            invocation.command_line()
        );
        let args = vec![String::from("-x"), self.node.clone(), remote];
        log::debug!("Running {} on {}", invocation.command_line(), self.node);
        let exit_code = spawn_and_wait(
            "ssh",
            &args,
            invocation,
            &invocation.log_path(),
            self.poll_interval,
            cancel,
        )?;
        finish(invocation, exit_code)
    }
}

fn spawn_and_wait(
    program: &str,
    args: &[String],
    invocation: &Invocation,
    capture: &Path,
    poll_interval: Duration,
    cancel: &CancelToken,
) -> Result<Option<i32>, ToolError> {
    if cancel.is_cancelled() {
        return Err(ToolError::Cancelled(invocation.program.clone()));
    }
    let log_file = File::create(capture)?;
    let err_file = log_file.try_clone()?;
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&invocation.work_dir)
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(err_file))
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    log::info!(
        "Launching {} in {}",
        invocation.command_line(),
        invocation.work_dir.to_string_lossy()
    );
    let mut child = command.spawn().map_err(|source| ToolError::LaunchFailure {
        program: program.to_string(),
        source,
    })?;

    if let (Some(text), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
        stdin.write_all(text.as_bytes())?;
        // stdin is closed on drop so the tool sees end of input
    }

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.code());
        }
        if cancel.is_cancelled() {
            log::warn!("Cancelling {}", invocation.command_line());
            child.kill()?;
            child.wait()?;
            return Err(ToolError::Cancelled(invocation.program.clone()));
        }
        std::thread::sleep(poll_interval);
    }
}

fn finish(invocation: &Invocation, exit_code: Option<i32>) -> Result<ToolOutcome, ToolError> {
    let log_path = invocation.log_path();
    let log_text = read_log(&log_path)?;
    if exit_code != Some(0) {
        log::debug!(
            "{} exited with {:?}; the log decides whether it failed",
            invocation.program,
            exit_code
        );
    }
    Ok(ToolOutcome {
        log_path,
        log_text,
        exit_code,
    })
}

/// Read a log that may contain bytes that are not UTF-8
pub fn read_log(path: &Path) -> Result<String, std::io::Error> {
    if !path.exists() {
        return Ok(String::new());
    }
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_captures_output_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation::new("cat", dir.path(), "cat.log").stdin("SETTING C2\n");
        let outcome = LocalInvoker::default()
            .run(&invocation, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.log_text, "SETTING C2\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(dir.path().join("cat.log").exists());
    }

    #[test]
    fn test_nonzero_exit_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let invocation =
            Invocation::new("sh", dir.path(), "XDS.LOG").args(&["-c", "echo partial; exit 3"]);
        let outcome = LocalInvoker::default()
            .run(&invocation, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.log_text.contains("partial"));
    }

    #[test]
    fn test_missing_program_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation::new("no_such_xds_binary_here", dir.path(), "XDS.LOG");
        let result = LocalInvoker::default().run(&invocation, &CancelToken::new());
        assert!(matches!(result, Err(ToolError::LaunchFailure { .. })));
    }

    #[test]
    fn test_cancel_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation::new("sleep", dir.path(), "sleep.log").arg("30");
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let start = std::time::Instant::now();
        let result = LocalInvoker::new(Duration::from_millis(5)).run(&invocation, &cancel);
        assert!(matches!(result, Err(ToolError::Cancelled(_))));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_cluster_submission_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let submit = vec![String::from("sh"), String::from("-c"), String::from("echo \"$0 $1\"")];
        let invocation = Invocation::new("xds_par", dir.path(), "XDS.LOG").arg("extra");
        let outcome = ClusterInvoker::new(&submit, Duration::from_millis(5))
            .run(&invocation, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.log_text.trim(), "xds_par extra");
    }
}
