//! Build descriptions sent to the remote.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::path::{StoreDir, StorePath};
use crate::{Error, Result};

/// A self-contained build description with all inputs resolved to paths.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct BasicDerivation {
    /// Derivation name.
    pub name: String,
    /// Outputs by name.
    pub outputs: BTreeMap<String, DerivationOutput>,
    /// Source paths the build reads.
    pub input_srcs: BTreeSet<StorePath>,
    /// Platform the build must run on, e.g. `x86_64-linux`.
    pub platform: String,
    /// Program that performs the build.
    pub builder: String,
    /// Arguments to the builder.
    pub args: Vec<String>,
    /// Environment of the builder.
    pub env: BTreeMap<String, String>,
}

impl BasicDerivation {
    /// Creates a derivation with no outputs, inputs or environment.
    pub fn new(
        name: impl Into<String>,
        platform: impl Into<String>,
        builder: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            builder: builder.into(),
            ..Self::default()
        }
    }

    /// Adds an output.
    #[must_use]
    pub fn output(mut self, name: impl Into<String>, output: DerivationOutput) -> Self {
        self.outputs.insert(name.into(), output);
        self
    }

    /// Adds a builder argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds an input source.
    #[must_use]
    pub fn input_src(mut self, path: StorePath) -> Self {
        self.input_srcs.insert(path);
        self
    }
}

/// How one output's path is determined.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DerivationOutput {
    /// Path fixed by the derivation's inputs.
    InputAddressed(StorePath),
    /// Path fixed by an expected content hash.
    Fixed {
        /// Resulting path.
        path: StorePath,
        /// Hash algorithm, e.g. `r:sha256`.
        hash_algo: String,
        /// Expected hash in hex.
        hash: String,
    },
    /// Content-addressed output whose path is known only after building.
    Floating {
        /// Hash algorithm, e.g. `r:sha256`.
        hash_algo: String,
    },
    /// Input-addressed output whose path is not computed yet.
    Deferred,
}

impl DerivationOutput {
    /// Returns the `(path, hash_algo, hash)` triple as sent on the wire.
    pub(crate) fn wire_fields(&self, dir: &StoreDir) -> (String, &str, &str) {
        match self {
            Self::InputAddressed(p) => (dir.print(p), "", ""),
            Self::Fixed {
                path,
                hash_algo,
                hash,
            } => (dir.print(path), hash_algo, hash),
            Self::Floating { hash_algo } => (String::new(), hash_algo, ""),
            Self::Deferred => (String::new(), "", ""),
        }
    }
}

/// Which outputs of a derivation to build.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum OutputsSpec {
    /// Every output.
    All,
    /// The named outputs.
    Names(BTreeSet<String>),
}

/// Something to build: an existing path or outputs of a derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DerivedPath {
    /// A path that must be made valid as-is.
    Opaque(StorePath),
    /// Outputs of a derivation.
    Built {
        /// The derivation file.
        drv_path: StorePath,
        /// Requested outputs.
        outputs: OutputsSpec,
    },
}

impl DerivedPath {
    /// Shorthand for every output of `drv_path`.
    pub const fn all_outputs(drv_path: StorePath) -> Self {
        Self::Built {
            drv_path,
            outputs: OutputsSpec::All,
        }
    }

    /// Parses `path`, `drv!*` or `drv!out,dev`; paths may be full or bare.
    pub fn parse(dir: &StoreDir, s: &str) -> Result<Self> {
        let Some((drv, outputs)) = s.split_once('!') else {
            return Ok(Self::Opaque(dir.parse_lenient(s)?));
        };
        let drv_path = dir.parse_lenient(drv)?;
        let outputs = if outputs == "*" {
            OutputsSpec::All
        } else {
            let names: BTreeSet<String> = outputs
                .split(',')
                .filter(|n| !n.is_empty())
                .map(str::to_owned)
                .collect();
            if names.is_empty() {
                return Err(Error::Usage(format!("'{s}' names no outputs")));
            }
            OutputsSpec::Names(names)
        };
        Ok(Self::Built { drv_path, outputs })
    }

    /// Prints the target with full paths.
    pub fn print(&self, dir: &StoreDir) -> String {
        match self {
            Self::Opaque(p) => dir.print(p),
            Self::Built { drv_path, outputs } => {
                format!("{}!{}", dir.print(drv_path), Outputs(outputs))
            }
        }
    }
}

/// Display adapter for the outputs part of a target.
struct Outputs<'a>(&'a OutputsSpec);

impl fmt::Display for Outputs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            OutputsSpec::All => f.write_str("*"),
            OutputsSpec::Names(names) => {
                let mut first = true;
                for n in names {
                    if !first {
                        f.write_str(",")?;
                    }
                    f.write_str(n)?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}
