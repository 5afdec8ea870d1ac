//! Subprocess adapter for an ACTS-compatible covering-array generator.
//!
//! The command line is a template; `{algo}`, `{strength}`, `{input}` and
//! `{output}` are substituted per call. Each call runs in its own temporary
//! directory, removed on every exit path.
use super::{parse_output, CoveringArrayTool, ToolModel};
use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

pub const DEFAULT_ALGORITHM: &str = "ipog";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct ActsTool {
    template: Vec<String>,
    algorithm: String,
    deadline: Option<Instant>,
}

impl ActsTool {
    pub fn new(command: &str) -> Result<Self> {
        let template = shell_words::split(command)
            .with_context(|| format!("parse covering-array command: {command}"))?;
        if template.is_empty() {
            return Err(anyhow!("covering-array command is empty"));
        }
        Ok(Self {
            template,
            algorithm: DEFAULT_ALGORITHM.to_string(),
            deadline: None,
        })
    }

    /// Kill the tool if it is still running at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn program(&self) -> &str {
        &self.template[0]
    }

    fn args(&self, strength: usize, input: &str, output: &str) -> Vec<String> {
        self.template
            .iter()
            .map(|token| {
                token
                    .replace("{algo}", &self.algorithm)
                    .replace("{strength}", &strength.to_string())
                    .replace("{input}", input)
                    .replace("{output}", output)
            })
            .collect()
    }
}

impl CoveringArrayTool for ActsTool {
    fn generate(&self, model: &ToolModel, strength: usize) -> Result<Vec<Vec<usize>>> {
        let scratch = tempfile::Builder::new()
            .prefix("restcov-ca-")
            .tempdir()
            .context("create covering-array scratch dir")?;
        let input = scratch.path().join("model.txt");
        let output = scratch.path().join("array.csv");
        let stderr_path = scratch.path().join("stderr.txt");
        fs::write(&input, model.render())
            .with_context(|| format!("write {}", input.display()))?;
        let stderr = fs::File::create(&stderr_path)
            .with_context(|| format!("create {}", stderr_path.display()))?;

        let args = self.args(
            strength,
            &input.display().to_string(),
            &output.display().to_string(),
        );
        let start = Instant::now();
        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .spawn()
            .with_context(|| format!("spawn covering-array tool: {}", args[0]))?;

        let status = loop {
            if let Some(status) = child.try_wait().context("wait for covering-array tool")? {
                break status;
            }
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                let _ = child.kill();
                let _ = child.wait();
                bail!("covering-array tool still running when the budget ran out");
            }
            std::thread::sleep(POLL_INTERVAL);
        };
        let elapsed_ms = start.elapsed().as_millis();
        tracing::info!(
            elapsed_ms,
            params = model.params.len(),
            constraints = model.constraints.len(),
            strength,
            "covering-array tool finished"
        );

        if !status.success() {
            let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
            return Err(anyhow!(
                "covering-array tool failed with status {}: {}",
                status,
                stderr.trim()
            ));
        }
        let text = fs::read_to_string(&output)
            .with_context(|| format!("read {}", output.display()))?;
        parse_output(&text, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::ToolParam;

    fn model() -> ToolModel {
        ToolModel {
            name: "op".to_string(),
            params: vec![
                ToolParam {
                    pseudo: "p0".to_string(),
                    size: 2,
                },
                ToolParam {
                    pseudo: "p1".to_string(),
                    size: 2,
                },
            ],
            constraints: Vec::new(),
        }
    }

    #[test]
    fn template_placeholders_are_substituted() {
        let tool = ActsTool::new("java -Dalgo={algo} -Ddoi={strength} -jar acts.jar {input} {output}")
            .expect("tool");
        assert_eq!(tool.program(), "java");
        assert_eq!(
            tool.args(3, "/tmp/in.txt", "/tmp/out.csv"),
            vec![
                "java",
                "-Dalgo=ipog",
                "-Ddoi=3",
                "-jar",
                "acts.jar",
                "/tmp/in.txt",
                "/tmp/out.csv"
            ]
        );
        assert!(ActsTool::new("   ").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn generate_reads_the_output_file() {
        let tool = ActsTool::new("sh -c 'printf \"# header\\np0,p1\\n0,1\\n1,0\\n\" > \"$1\"' sh {output}")
            .expect("tool");
        let rows = tool.generate(&model(), 2).expect("rows");
        assert_eq!(rows, vec![vec![0, 1], vec![1, 0]]);
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_is_an_error() {
        let tool = ActsTool::new("sh -c 'echo broken >&2; exit 3'").expect("tool");
        let err = tool.generate(&model(), 2).expect_err("failure");
        assert!(err.to_string().contains("broken"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kills_a_hung_tool() {
        let tool = ActsTool::new("sleep 5")
            .expect("tool")
            .with_deadline(Instant::now() + Duration::from_millis(50));
        let start = Instant::now();
        assert!(tool.generate(&model(), 2).is_err());
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
