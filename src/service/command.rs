use super::ServiceMeta;
use crate::eval::render_string;
use crate::model::Output;
use crate::worker::{TaskContext, TaskHandler};
use anyhow::{Context, bail};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Runs the service's command once per request.
///
/// Recognised parameters besides those used in `args`: `inputs`, a list of
/// URLs staged into the working directory before the run, and `outputs`, a
/// list of URLs the command's files are flushed to afterwards. Their local
/// paths are exposed to templates as `inputs` and `outputs`.
pub struct CommandHandler {
    meta: ServiceMeta,
}

impl CommandHandler {
    pub fn new(meta: ServiceMeta) -> Self {
        Self { meta }
    }
}

fn urls(params: &Output, key: &str) -> anyhow::Result<Vec<String>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .with_context(|| format!("{key}: expected a list of url strings"))
            })
            .collect(),
        Some(_) => bail!("{key}: expected a list of url strings"),
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn run(&self, ctx: &mut TaskContext) -> anyhow::Result<Output> {
        let mut vars = ctx.request.parameters.clone();

        let mut staged = Vec::new();
        for url in urls(&vars, "inputs")? {
            let path = ctx.fs.add_input(&url).await?;
            staged.push(Value::String(path.display().to_string()));
        }
        let mut outputs = Vec::new();
        for url in urls(&vars, "outputs")? {
            let path = ctx.fs.add_output(&url).await?;
            outputs.push(Value::String(path.display().to_string()));
        }
        vars.insert("inputs".into(), Value::Array(staged));
        vars.insert("outputs".into(), Value::Array(outputs));

        let args = self
            .meta
            .args
            .iter()
            .map(|arg| render_string(arg, &vars))
            .collect::<crate::error::Result<Vec<_>>>()
            .context("rendering arguments")?;

        let service = self.meta.name.as_str();
        let exec = ctx
            .env
            .execute(
                &self.meta.command,
                &args,
                &mut |line: &str| debug!(service, stream = "stdout", "{line}"),
                &mut |line: &str| debug!(service, stream = "stderr", "{line}"),
            )
            .await
            .with_context(|| format!("running {}", self.meta.command))?;

        if !exec.success() {
            let detail = exec.stderr.lines().last().unwrap_or("").to_string();
            bail!(
                "{} exited with status {}: {detail}",
                self.meta.command,
                exec.exit_code
            );
        }

        let mut output = Output::new();
        output.insert("exit_code".into(), Value::from(exec.exit_code));
        output.insert("stdout".into(), Value::String(exec.stdout));
        output.insert("stderr".into(), Value::String(exec.stderr));
        Ok(output)
    }
}
