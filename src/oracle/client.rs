//! Command-line LM invocation and response cleanup.
use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Instant;

/// Run `command` with `prompt` on stdin and return its stdout.
pub fn invoke_command(command: &str, prompt: &str) -> Result<String> {
    let args = shell_words::split(command).with_context(|| format!("parse LM command: {command}"))?;
    if args.is_empty() {
        return Err(anyhow!("LM command is empty"));
    }

    let start = Instant::now();
    let mut child = Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn LM command: {}", args[0]))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(prompt.as_bytes())
            .context("write prompt to LM stdin")?;
    }

    let output = child.wait_with_output().context("wait for LM command")?;
    let elapsed_ms = start.elapsed().as_millis();
    tracing::info!(
        elapsed_ms,
        prompt_bytes = prompt.len(),
        response_bytes = output.stdout.len(),
        "lm invoke complete"
    );

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "LM command failed with status {}: {}",
            output.status,
            stderr.trim()
        ));
    }
    String::from_utf8(output.stdout).context("decode LM stdout as UTF-8")
}

/// Strip markdown fences around a JSON answer.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();
    if let Some(start) = text.find("```json") {
        let start = start + 7;
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
    }
    if let Some(start) = text.find("```") {
        let start = start + 3;
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
    }
    // fall back to the outermost braces
    match (text.find('{'), text.rfind('}')) {
        (Some(open), Some(close)) if open < close => &text[open..=close],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_plain() {
        assert_eq!(extract_json(r#"{"params": []}"#), r#"{"params": []}"#);
    }

    #[test]
    fn extract_json_with_fences() {
        let text = "Here you go:\n```json\n{\"params\": [\"a\"]}\n```\nDone.";
        assert_eq!(extract_json(text), "{\"params\": [\"a\"]}");
        let text = "```\n{\"values\": {}}\n```";
        assert_eq!(extract_json(text), "{\"values\": {}}");
    }

    #[test]
    fn extract_json_from_chatty_text() {
        let text = "Sure! {\"constraints\": []} Hope this helps.";
        assert_eq!(extract_json(text), "{\"constraints\": []}");
    }

    #[cfg(unix)]
    #[test]
    fn invoke_command_pipes_prompt_through() {
        let output = invoke_command("cat", "{\"params\": []}").expect("cat");
        assert_eq!(output, "{\"params\": []}");
        assert!(invoke_command("sh -c 'exit 2'", "").is_err());
        assert!(invoke_command("", "").is_err());
    }
}
