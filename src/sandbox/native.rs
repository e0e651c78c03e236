//! Native process execution with tokio::process.

use super::{Environment, ExecOutput, LineSink};
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio::process::{Child, Command};
use tracing::debug;

/// Runs commands as child processes inside a working directory.
#[derive(Debug, Clone)]
pub struct NativeEnvironment {
    working_dir: PathBuf,
    vars: Vec<(String, String)>,
}

impl NativeEnvironment {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            vars: Vec::new(),
        }
    }

    /// Add an environment variable for every command run here.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Relative command paths are resolved against the process CWD, not
    /// the working directory the child is started in.
    fn resolve(cmd: &str) -> Result<PathBuf> {
        let path = Path::new(cmd);
        if path.components().count() > 1 && path.is_relative() {
            Ok(std::env::current_dir()?.join(path))
        } else {
            Ok(path.to_path_buf())
        }
    }
}

#[async_trait]
impl Environment for NativeEnvironment {
    async fn execute(
        &self,
        cmd: &str,
        args: &[String],
        on_stdout: LineSink<'_>,
        on_stderr: LineSink<'_>,
    ) -> Result<ExecOutput> {
        let program = Self::resolve(cmd)?;
        debug!(
            command = %program.display(),
            dir = %self.working_dir.display(),
            "executing"
        );

        let mut child = Command::new(&program)
            .args(args)
            .current_dir(&self.working_dir)
            .envs(self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut output = ExecOutput::default();
        if let Err(e) = pump(&mut child, &mut output, on_stdout, on_stderr).await {
            let _ = child.kill().await;
            return Err(e.into());
        }

        let status = child.wait().await?;
        output.exit_code = status.code().unwrap_or(-1);
        Ok(output)
    }
}

type Segments<R> = Option<Split<BufReader<R>>>;

/// Forward both output streams line by line until each reaches EOF.
/// Bytes that are not UTF-8 are replaced, never an error.
async fn pump(
    child: &mut Child,
    output: &mut ExecOutput,
    on_stdout: LineSink<'_>,
    on_stderr: LineSink<'_>,
) -> std::io::Result<()> {
    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => match line? {
                Some(line) => {
                    on_stdout(&line);
                    output.stdout.push_str(&line);
                    output.stdout.push('\n');
                }
                None => stdout = None,
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line? {
                Some(line) => {
                    on_stderr(&line);
                    output.stderr.push_str(&line);
                    output.stderr.push('\n');
                }
                None => stderr = None,
            },
        }
    }
    Ok(())
}

async fn next_line<R>(segments: &mut Segments<R>) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let Some(segments) = segments else {
        return Ok(None);
    };
    Ok(segments.next_segment().await?.map(|mut bytes| {
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_and_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let env = NativeEnvironment::new(dir.path()).env("GREETING", "hello");

        let mut seen_out = Vec::new();
        let mut seen_err = Vec::new();
        let output = env
            .execute(
                "/bin/sh",
                &[
                    "-c".to_string(),
                    "echo $GREETING; echo oops >&2; echo two; exit 3".to_string(),
                ],
                &mut |l: &str| seen_out.push(l.to_string()),
                &mut |l: &str| seen_err.push(l.to_string()),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert_eq!(output.stdout, "hello\ntwo\n");
        assert_eq!(output.stderr, "oops\n");
        assert_eq!(seen_out, vec!["hello", "two"]);
        assert_eq!(seen_err, vec!["oops"]);
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let env = NativeEnvironment::new(dir.path());
        let output = env
            .execute(
                "/bin/sh",
                &["-c".to_string(), "touch marker".to_string()],
                &mut |_: &str| {},
                &mut |_: &str| {},
            )
            .await
            .unwrap();
        assert!(output.success());
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn invalid_utf8_output_is_replaced_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let env = NativeEnvironment::new(dir.path());
        let mut seen = Vec::new();
        let output = env
            .execute(
                "/bin/sh",
                &[
                    "-c".to_string(),
                    r"printf 'caf\351\n'; printf 'bad\377\n' >&2; echo done".to_string(),
                ],
                &mut |l: &str| seen.push(l.to_string()),
                &mut |_: &str| {},
            )
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(seen, vec!["caf\u{FFFD}", "done"]);
        assert_eq!(output.stdout, "caf\u{FFFD}\ndone\n");
        assert_eq!(output.stderr, "bad\u{FFFD}\n");
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = NativeEnvironment::new(dir.path());
        let err = env
            .execute("/definitely/not/here", &[], &mut |_: &str| {}, &mut |_: &str| {})
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }
}
