use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How structure names declared for a case map onto its phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseNaming {
    /// Phase-specific when every declared name ends in `_<digits>`.
    #[default]
    Auto,
    /// Names always carry a `_<phaseDigits>` suffix.
    PhaseSpecific,
    /// Every declared name applies to every phase.
    Shared,
}

/// Neighbourhood used when labelling connected mask regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Connectivity {
    /// 6 neighbours sharing a face.
    Face,
    /// 26 neighbours sharing a face, edge or corner.
    #[default]
    Full,
}

/// Held-out membership of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subset {
    Train,
    Test,
}

impl Subset {
    /// Directory suffix used by the raw dataset layout.
    pub fn suffix(&self) -> &'static str {
        match self {
            Subset::Train => "Tr",
            Subset::Test => "Ts",
        }
    }
}
