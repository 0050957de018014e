//! Remote builds.
//!
//! Every build request carries the caller's [`BuildSettings`], encoded with
//! only the fields the negotiated version defines. Build logs are not part
//! of the response; they arrive on the transport's diagnostic stream.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sshstore_proto::Command;

use crate::derivation::{BasicDerivation, DerivedPath, OutputsSpec};
use crate::path::{StoreDir, StorePath};
use crate::session::Session;
use crate::{Error, Result};

/// Limits and policies applied to remote builds.
///
/// Fields the remote's protocol version does not know are not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct BuildSettings {
    /// Seconds without output before a build is killed (0 = no limit).
    pub max_silent_time: u64,
    /// Seconds a build may run in total (0 = no limit).
    pub build_timeout: u64,
    /// Bytes of log output allowed (0 = no limit). Protocol 2.2+.
    pub max_log_size: u64,
    /// Extra rebuilds to check determinism. Protocol 2.3+.
    pub build_repeat: u64,
    /// Fail if repeated builds differ. Protocol 2.3+.
    pub enforce_determinism: bool,
    /// Keep the build directory of failed builds. Protocol 2.7+.
    pub keep_failed: bool,
}

/// Status code reported by the remote for a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum BuildStatus {
    /// Built successfully.
    Built,
    /// Fetched from a substituter.
    Substituted,
    /// Already present.
    AlreadyValid,
    /// The builder failed.
    PermanentFailure,
    /// An input was rejected.
    InputRejected,
    /// An output was rejected.
    OutputRejected,
    /// Failed for a reason that may go away on retry.
    TransientFailure,
    /// Failed earlier and the failure is cached.
    CachedFailure,
    /// Hit a time limit.
    TimedOut,
    /// Some other failure.
    MiscFailure,
    /// A dependency failed.
    DependencyFailed,
    /// Produced too much log output.
    LogLimitExceeded,
    /// Repeated builds differed.
    NotDeterministic,
    /// Resolved to a derivation whose outputs are valid.
    ResolvesToAlreadyValid,
    /// No substituter could provide the path.
    NoSubstituters,
}

/// Coarse classification of a [`BuildStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildOutcomeKind {
    /// The outputs are valid.
    Success,
    /// Retrying will not help.
    PermanentFailure,
    /// Retrying may help.
    TransientFailure,
    /// A time limit was hit.
    Timeout,
}

impl BuildStatus {
    /// Returns the coarse classification.
    pub const fn kind(self) -> BuildOutcomeKind {
        match self {
            Self::Built | Self::Substituted | Self::AlreadyValid | Self::ResolvesToAlreadyValid => {
                BuildOutcomeKind::Success
            }
            Self::TransientFailure => BuildOutcomeKind::TransientFailure,
            Self::TimedOut => BuildOutcomeKind::Timeout,
            Self::PermanentFailure
            | Self::InputRejected
            | Self::OutputRejected
            | Self::CachedFailure
            | Self::MiscFailure
            | Self::DependencyFailed
            | Self::LogLimitExceeded
            | Self::NotDeterministic
            | Self::NoSubstituters => BuildOutcomeKind::PermanentFailure,
        }
    }

    /// Returns `true` if the outputs are valid.
    pub const fn is_success(self) -> bool {
        matches!(self.kind(), BuildOutcomeKind::Success)
    }
}

impl TryFrom<u64> for BuildStatus {
    type Error = u64;

    fn try_from(code: u64) -> std::result::Result<Self, u64> {
        Ok(match code {
            0 => Self::Built,
            1 => Self::Substituted,
            2 => Self::AlreadyValid,
            3 => Self::PermanentFailure,
            4 => Self::InputRejected,
            5 => Self::OutputRejected,
            6 => Self::TransientFailure,
            7 => Self::CachedFailure,
            8 => Self::TimedOut,
            9 => Self::MiscFailure,
            10 => Self::DependencyFailed,
            11 => Self::LogLimitExceeded,
            12 => Self::NotDeterministic,
            13 => Self::ResolvesToAlreadyValid,
            14 => Self::NoSubstituters,
            other => return Err(other),
        })
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where one output of a derivation ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Realisation {
    /// `sha256:<derivation hash>!<output name>`.
    pub id: String,
    /// Resulting path, without the store directory.
    pub out_path: String,
    /// Signatures over the realisation.
    #[serde(default)]
    pub signatures: BTreeSet<String>,
    /// Realisations this one depends on.
    #[serde(default)]
    pub dependent_realisations: BTreeMap<String, String>,
}

impl Realisation {
    /// Returns the output name encoded in the id.
    pub fn output_name(&self) -> Option<&str> {
        self.id.rsplit_once('!').map(|(_, name)| name)
    }

    /// Parses the output path.
    pub fn path(&self, dir: &StoreDir) -> Result<StorePath> {
        dir.parse_lenient(&self.out_path)
    }
}

/// Outcome of one build request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct BuildResult {
    /// What happened.
    pub status: BuildStatus,
    /// Error text for failed builds.
    pub error_msg: Option<String>,
    /// How many times the derivation was built (protocol 2.3+).
    pub times_built: u64,
    /// Whether repeated builds differed (protocol 2.3+).
    pub is_non_deterministic: bool,
    /// Build start, seconds since the epoch (protocol 2.3+).
    pub start_time: u64,
    /// Build end, seconds since the epoch (protocol 2.3+).
    pub stop_time: u64,
    /// Outputs by name (protocol 2.6+).
    pub built_outputs: BTreeMap<String, Realisation>,
}

impl BuildResult {
    /// Creates a result carrying only a status.
    pub const fn new(status: BuildStatus) -> Self {
        Self {
            status,
            error_msg: None,
            times_built: 0,
            is_non_deterministic: false,
            start_time: 0,
            stop_time: 0,
            built_outputs: BTreeMap::new(),
        }
    }

    /// Returns `true` if the outputs are valid.
    pub const fn success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns the coarse classification.
    pub const fn kind(&self) -> BuildOutcomeKind {
        self.status.kind()
    }
}

impl Session {
    /// Writes `settings` as far as the negotiated version allows.
    pub(crate) async fn put_build_settings(&mut self, settings: &BuildSettings) -> Result<()> {
        let minor = self.version().minor();
        self.send_u64(settings.max_silent_time).await?;
        self.send_u64(settings.build_timeout).await?;
        if minor >= 2 {
            self.send_u64(settings.max_log_size).await?;
        }
        if minor >= 3 {
            self.send_u64(settings.build_repeat).await?;
            self.send_bool(settings.enforce_determinism).await?;
        }
        if minor >= 7 {
            self.send_bool(settings.keep_failed).await?;
        }
        Ok(())
    }

    /// Builds `drv` remotely as-is; no input resolution happens locally.
    pub async fn build_derivation(
        &mut self,
        drv_path: &StorePath,
        drv: &BasicDerivation,
        settings: &BuildSettings,
    ) -> Result<BuildResult> {
        let seq = self.begin(Command::BuildDerivation)?;
        let result = async {
            self.send_command(Command::BuildDerivation).await?;
            self.send_path(drv_path).await?;
            self.send_derivation(drv).await?;
            self.put_build_settings(settings).await?;
            self.flush().await?;
            self.recv_build_result().await
        }
        .await;
        let result = self.finish(seq, result)?;
        tracing::debug!(drv = %drv_path, status = %result.status, "remote build finished");
        Ok(result)
    }

    /// Encodes a derivation.
    async fn send_derivation(&mut self, drv: &BasicDerivation) -> Result<()> {
        self.send_u64(drv.outputs.len() as u64).await?;
        for (name, output) in &drv.outputs {
            let (path, hash_algo, hash) = output.wire_fields(self.store_dir());
            self.send_str(name).await?;
            self.send_str(&path).await?;
            self.send_str(hash_algo).await?;
            self.send_str(hash).await?;
        }
        self.send_paths(&drv.input_srcs).await?;
        self.send_str(&drv.platform).await?;
        self.send_str(&drv.builder).await?;
        self.send_strings(&drv.args).await?;
        self.send_u64(drv.env.len() as u64).await?;
        for (key, value) in &drv.env {
            self.send_str(key).await?;
            self.send_str(value).await?;
        }
        Ok(())
    }

    /// Decodes the response to `BuildDerivation`.
    async fn recv_build_result(&mut self) -> Result<BuildResult> {
        let mut result = BuildResult::new(self.recv_status().await?);
        let msg = self.recv_string().await?;
        result.error_msg = (!msg.is_empty()).then_some(msg);
        let minor = self.version().minor();
        if minor >= 3 {
            result.times_built = self.recv_u64().await?;
            result.is_non_deterministic = self.recv_bool().await?;
            result.start_time = self.recv_u64().await?;
            result.stop_time = self.recv_u64().await?;
        }
        if minor >= 6 {
            let n = self.recv_u64().await?;
            for _ in 0..n {
                let id = self.recv_string().await?;
                let doc = self.recv_string().await?;
                let Some((_, name)) = id.rsplit_once('!') else {
                    return Err(Error::Protocol(format!("malformed output id '{id}'")));
                };
                let realisation: Realisation = serde_json::from_str(&doc)
                    .map_err(|e| Error::Protocol(format!("realisation of '{id}': {e}")))?;
                result.built_outputs.insert(name.to_owned(), realisation);
            }
        }
        Ok(result)
    }

    /// Reads and decodes a status word.
    async fn recv_status(&mut self) -> Result<BuildStatus> {
        let code = self.recv_u64().await?;
        BuildStatus::try_from(code)
            .map_err(|c| Error::Protocol(format!("unknown build status {c}")))
    }

    /// Builds or fetches `targets`; the remote resolves derivation outputs.
    ///
    /// Only the aggregate status is reported. A bare derivation path is
    /// rejected since the remote would build it rather than fetch the file.
    pub async fn build_paths(
        &mut self,
        targets: &[DerivedPath],
        settings: &BuildSettings,
    ) -> Result<BuildResult> {
        let printed = targets
            .iter()
            .map(|t| legacy_target(self.store_dir(), t))
            .collect::<Result<Vec<_>>>()?;

        let seq = self.begin(Command::BuildPaths)?;
        let result = async {
            self.send_command(Command::BuildPaths).await?;
            self.send_strings(&printed).await?;
            self.put_build_settings(settings).await?;
            self.flush().await?;
            let mut result = BuildResult::new(self.recv_status().await?);
            if !result.success() {
                result.error_msg = Some(self.recv_string().await?);
            }
            Ok::<_, Error>(result)
        }
        .await;
        self.finish(seq, result)
    }
}

/// Prints a target the way `BuildPaths` expects: every output of a
/// derivation is the bare derivation path.
fn legacy_target(dir: &StoreDir, target: &DerivedPath) -> Result<String> {
    match target {
        DerivedPath::Opaque(p) if p.is_derivation() => Err(Error::Usage(format!(
            "cannot fetch '{}' over the legacy ssh protocol: it would be built instead; \
             request its outputs with '!*'",
            dir.print(p)
        ))),
        DerivedPath::Opaque(p) => Ok(dir.print(p)),
        DerivedPath::Built {
            drv_path,
            outputs: OutputsSpec::All,
        } => Ok(dir.print(drv_path)),
        DerivedPath::Built { .. } => Ok(target.print(dir)),
    }
}
