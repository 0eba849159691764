use tokio::process::Command;

/// Thin runner for the `aws` command line client. Output is requested as JSON.
#[derive(Debug, Clone, Default)]
pub struct AwsCli {
    region: Option<String>,
}

impl AwsCli {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }

    /// Run `aws <args>` and return stdout, or a message describing the failure.
    pub async fn run(&self, args: &[String]) -> std::result::Result<String, String> {
        let mut cmd = Command::new("aws");
        cmd.args(args).args(["--output", "json"]);
        if let Some(region) = &self.region {
            cmd.args(["--region", region]);
        }
        tracing::debug!("aws {}", args.join(" "));
        let output = cmd
            .output()
            .await
            .map_err(|e| format!("failed to run aws: {e}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "aws {} failed (exit {}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Owned argument list from string slices.
pub fn args<const N: usize>(words: [&str; N]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}
