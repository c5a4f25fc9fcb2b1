use crate::enums::PhaseNaming;

/// Structure names that apply to one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub names: Vec<String>,
    pub phase_specific: bool,
}

/// Decides which declared structures belong to a phase.
pub trait PhaseResolver: Send + Sync {
    fn resolve(&self, declared: &[String], phase: &str) -> Resolution;
}

/// Matches `<name>_<digits>` suffixes against the digits of the phase folder.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuffixPhaseResolver {
    naming: PhaseNaming,
}

impl SuffixPhaseResolver {
    pub fn new(naming: PhaseNaming) -> Self {
        Self { naming }
    }

    /// Auto mode is all-or-nothing: one unsuffixed name makes every name shared.
    pub fn is_phase_specific(&self, declared: &[String]) -> bool {
        match self.naming {
            PhaseNaming::PhaseSpecific => true,
            PhaseNaming::Shared => false,
            PhaseNaming::Auto => declared.iter().all(|name| phase_suffix(name).is_some()),
        }
    }
}

impl PhaseResolver for SuffixPhaseResolver {
    fn resolve(&self, declared: &[String], phase: &str) -> Resolution {
        let phase_specific = self.is_phase_specific(declared);
        let names = if phase_specific {
            let digits = phase_digits(phase);
            declared
                .iter()
                .filter(|name| phase_suffix(name) == Some(digits.as_str()))
                .cloned()
                .collect()
        } else {
            declared.to_vec()
        };
        Resolution {
            names,
            phase_specific,
        }
    }
}

/// "CT_50" -> "50", "Phase0" -> "0"
pub fn phase_digits(phase: &str) -> String {
    phase.chars().filter(char::is_ascii_digit).collect()
}

/// The all-digit segment after the last underscore, if there is one.
pub fn phase_suffix(name: &str) -> Option<&str> {
    let (_, suffix) = name.rsplit_once('_')?;
    (!suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit())).then_some(suffix)
}
