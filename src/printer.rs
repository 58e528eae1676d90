use crate::errors::{Result, SpoolerError};
use crate::status::PrinterStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// A printer-like destination reported by the print system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    pub name: String,
}

impl OutputTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Access to the physical print system.
///
/// An empty `list_targets` result means "nothing reachable right now" and is
/// never an error. Any error from `submit` fails the job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutputTargetProvider: Send + Sync {
    async fn list_targets(&self) -> Vec<OutputTarget>;

    /// Hand a rendered document to `target`; returns the print system's job reference.
    async fn submit(&self, target: &str, document: &[u8], label: &str) -> Result<String>;
}

/// How to pick a target when several are reachable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TargetSelection {
    /// First target in provider order.
    #[default]
    First,
    /// First target whose name contains one of `patterns` (case-insensitive),
    /// falling back to the first target.
    Prefer { patterns: Vec<String> },
}

impl TargetSelection {
    pub fn select<'a>(&self, targets: &'a [OutputTarget]) -> Option<&'a OutputTarget> {
        match self {
            TargetSelection::First => targets.first(),
            TargetSelection::Prefer { patterns } => {
                let patterns: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
                targets
                    .iter()
                    .find(|t| {
                        let name = t.name.to_lowercase();
                        patterns.iter().any(|p| name.contains(p.as_str()))
                    })
                    .or_else(|| targets.first())
            }
        }
    }
}

/// Poll the provider and summarize reachability for the UI.
#[tracing::instrument(skip_all)]
pub async fn check_status(
    provider: &dyn OutputTargetProvider,
    selection: &TargetSelection,
) -> PrinterStatus {
    let targets = provider.list_targets().await;
    let selected = selection.select(&targets).map(|t| t.name.clone());

    debug!("Printer status: {} target(s), selected {:?}", targets.len(), selected);

    PrinterStatus {
        connected: !targets.is_empty(),
        targets: targets.into_iter().map(|t| t.name).collect(),
        selected,
    }
}

// ============================================================================
// CUPS command line backend
// ============================================================================

/// Talks to CUPS through `lpstat` and `lp`.
pub struct LpProvider {
    lpstat_bin: String,
    lp_bin: String,
}

impl Default for LpProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LpProvider {
    pub fn new() -> Self {
        Self::with_binaries("lpstat", "lp")
    }

    /// Override the tool paths (non-standard installs, tests).
    pub fn with_binaries(lpstat_bin: impl Into<String>, lp_bin: impl Into<String>) -> Self {
        Self {
            lpstat_bin: lpstat_bin.into(),
            lp_bin: lp_bin.into(),
        }
    }
}

#[async_trait]
impl OutputTargetProvider for LpProvider {
    async fn list_targets(&self) -> Vec<OutputTarget> {
        let output = match Command::new(&self.lpstat_bin).arg("-e").output().await {
            Ok(output) => output,
            Err(e) => {
                warn!("Failed to run {}: {}", self.lpstat_bin, e);
                return Vec::new();
            }
        };

        if !output.status.success() {
            // lpstat exits non-zero when no destinations exist
            debug!(
                "{} exited with {}: {}",
                self.lpstat_bin,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Vec::new();
        }

        parse_destinations(&String::from_utf8_lossy(&output.stdout))
    }

    #[tracing::instrument(skip(self, document), fields(bytes = document.len()))]
    async fn submit(&self, target: &str, document: &[u8], label: &str) -> Result<String> {
        let mut child = Command::new(&self.lp_bin)
            .args(["-d", target, "-t", label])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SpoolerError::Submit(format!("Failed to run {}: {}", self.lp_bin, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(document)
                .await
                .map_err(|e| SpoolerError::Submit(format!("Failed to stream document: {}", e)))?;
            // Dropping stdin closes the pipe so lp sees EOF
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("{} rejected job for {}: {}", self.lp_bin, target, stderr.trim());
            return Err(SpoolerError::Submit(format!(
                "{} exited with {}: {}",
                self.lp_bin,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let request_id = parse_request_id(&stdout).unwrap_or_else(|| {
            warn!("Could not parse lp output: {}", stdout.trim());
            String::from("unknown")
        });

        info!("Submitted to {} as {}", target, request_id);
        Ok(request_id)
    }
}

/// One destination name per `lpstat -e` line.
fn parse_destinations(stdout: &str) -> Vec<OutputTarget> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(OutputTarget::new)
        .collect()
}

/// Extract `PRN-42` from `request id is PRN-42 (1 file(s))`.
fn parse_request_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("request id is "))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
}

// ============================================================================
// Native backend (`printers` crate)
// ============================================================================

#[cfg(feature = "native-printers")]
pub use native::NativePrinterProvider;

#[cfg(feature = "native-printers")]
mod native {
    use super::*;

    /// Uses the platform print API (CUPS on unix, winspool on Windows).
    #[derive(Default)]
    pub struct NativePrinterProvider;

    #[async_trait]
    impl OutputTargetProvider for NativePrinterProvider {
        async fn list_targets(&self) -> Vec<OutputTarget> {
            match tokio::task::spawn_blocking(printers::get_printers).await {
                Ok(found) => found.into_iter().map(|p| OutputTarget::new(p.name)).collect(),
                Err(e) => {
                    warn!("Printer enumeration task failed: {}", e);
                    Vec::new()
                }
            }
        }

        async fn submit(&self, target: &str, document: &[u8], label: &str) -> Result<String> {
            let target = target.to_string();
            let label = label.to_string();
            let document = document.to_vec();

            tokio::task::spawn_blocking(move || {
                let printer = printers::get_printer_by_name(&target)
                    .ok_or_else(|| SpoolerError::TargetNotFound(target.clone()))?;
                let options: Vec<(&str, &str)> = Vec::new();
                printer
                    .print(&document, Some(label.as_str()), &options)
                    .map(|job_id| job_id.to_string())
                    .map_err(|e| SpoolerError::Submit(format!("{}", e)))
            })
            .await
            .map_err(|e| SpoolerError::Submit(format!("Print task failed: {}", e)))?
        }
    }
}
