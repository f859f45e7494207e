use crate::config::{CodecConfig, CommandSpec};
use crate::error::RelayError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{Duration, timeout};

/// Audio format conversions. Implementations delete `input` once `output`
/// has been written successfully and leave it alone otherwise.
#[async_trait]
pub trait AudioCodec: Send + Sync {
    /// Uploaded client audio -> the format speech recognition accepts.
    async fn normalize(&self, input: &Path, output: &Path) -> Result<(), RelayError>;

    /// Synthesized speech -> the format clients download.
    async fn encode_result(&self, input: &Path, output: &Path) -> Result<(), RelayError>;
}

/// Shells out to an external converter such as ffmpeg.
pub struct ExternalCodec {
    normalize: CommandSpec,
    encode_result: CommandSpec,
    timeout: Duration,
}

impl ExternalCodec {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            normalize: config.normalize.clone(),
            encode_result: config.encode_result.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    async fn convert(&self, spec: &CommandSpec, input: &Path, output: &Path) -> Result<(), RelayError> {
        let input_arg = input.to_string_lossy();
        let output_arg = output.to_string_lossy();
        let args: Vec<String> = spec
            .args
            .iter()
            .map(|a| a.replace("{input}", &input_arg).replace("{output}", &output_arg))
            .collect();
        log::debug!("Running {} {}", spec.program, args.join(" "));

        let child = Command::new(&spec.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Conversion {
                program: spec.program.clone(),
                detail: format!("failed to spawn: {}", e),
            })?;

        // 超时后 child 被 drop，kill_on_drop 负责结束进程
        let output_status = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Err(RelayError::Conversion {
                    program: spec.program.clone(),
                    detail: format!("failed to wait: {}", e),
                });
            }
            Err(_) => {
                return Err(RelayError::Conversion {
                    program: spec.program.clone(),
                    detail: format!("timed out after {:?}", self.timeout),
                });
            }
        };

        if !output_status.status.success() {
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            log::error!(
                "{} exited with {}, input kept at {}: {}",
                spec.program,
                output_status.status,
                input.display(),
                stderr.trim()
            );
            return Err(RelayError::Conversion {
                program: spec.program.clone(),
                detail: format!("exited with {}", output_status.status),
            });
        }

        if let Err(e) = tokio::fs::remove_file(input).await {
            log::warn!("Converted {} but could not remove it: {}", input.display(), e);
        }
        Ok(())
    }
}

#[async_trait]
impl AudioCodec for ExternalCodec {
    async fn normalize(&self, input: &Path, output: &Path) -> Result<(), RelayError> {
        self.convert(&self.normalize, input, output).await
    }

    async fn encode_result(&self, input: &Path, output: &Path) -> Result<(), RelayError> {
        self.convert(&self.encode_result, input, output).await
    }
}
