//! Server implementation detection from the `server.version` banner.

use derive_more::Display;

/// The software family behind an Electrum endpoint.
///
/// Banners look like `ElectrumX 1.16.0`, `Fulcrum 1.9.1`, `electrs/0.10.0`
/// or `electrs-esplora 0.4.1`.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ServerImpl {
    /// ElectrumX.
    #[display("ElectrumX {version}")]
    ElectrumX {
        /// Version string as announced.
        version: String,
    },
    /// Fulcrum.
    #[display("Fulcrum {version}")]
    Fulcrum {
        /// Version string as announced.
        version: String,
    },
    /// romanz/electrs.
    #[display("electrs {major}.{minor}")]
    Electrs {
        /// Major version.
        major: u32,
        /// Minor version.
        minor: u32,
    },
    /// Blockstream's electrs fork.
    #[display("electrs-esplora {version}")]
    Esplora {
        /// Version string as announced.
        version: String,
    },
    /// Anything else.
    #[display("unknown")]
    Unknown,
}

impl ServerImpl {
    /// Classify a software banner.
    #[must_use]
    pub fn detect(banner: &str) -> Self {
        let lower = banner.trim().to_ascii_lowercase();
        let version_after = |prefix: &str| -> String {
            lower
                .find(prefix)
                .map(|at| &lower[at + prefix.len()..])
                .map(|rest| rest.trim_start_matches(['/', ' ', 'v']))
                .and_then(|rest| rest.split_whitespace().next())
                .unwrap_or_default()
                .to_string()
        };

        if lower.contains("electrumx") {
            Self::ElectrumX { version: version_after("electrumx") }
        } else if lower.contains("fulcrum") {
            Self::Fulcrum { version: version_after("fulcrum") }
        } else if lower.contains("esplora") {
            Self::Esplora { version: version_after("esplora") }
        } else if lower.contains("electrs") {
            let version = version_after("electrs");
            let mut parts = version.split('.').map(|p| p.parse::<u32>().ok());
            match (parts.next().flatten(), parts.next().flatten()) {
                (Some(major), Some(minor)) => Self::Electrs { major, minor },
                _ => Self::Unknown,
            }
        } else {
            Self::Unknown
        }
    }

    /// Whether requests may be batched as a single JSON array. Older electrs
    /// and esplora only answer newline-delimited batches reliably.
    #[must_use]
    pub const fn supports_array_batch(&self) -> bool {
        match self {
            Self::ElectrumX { .. } | Self::Fulcrum { .. } => true,
            Self::Electrs { major, minor } => *major > 0 || *minor >= 9,
            Self::Esplora { .. } | Self::Unknown => false,
        }
    }

    /// Whether the implementation earns the scoring bonus.
    #[must_use]
    pub const fn is_high_performance(&self) -> bool {
        matches!(self, Self::ElectrumX { .. } | Self::Fulcrum { .. })
    }

    /// Short family name stored in health records.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ElectrumX { .. } => "ElectrumX",
            Self::Fulcrum { .. } => "Fulcrum",
            Self::Electrs { .. } => "electrs",
            Self::Esplora { .. } => "electrs-esplora",
            Self::Unknown => "unknown",
        }
    }
}
