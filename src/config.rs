//! Configuration recognized by the committed-domain subsystem.
//!
//! This is a plain struct, not a config-file parser - parsing
//! `commitment_mode` strings is the one piece of text handling this crate
//! does itself; everything else is set directly by the host.

/// Governs whether touched keys carry in-band update structs, rely on
/// callback re-reads, or are ignored entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CommitmentMode {
    /// Touches are discarded; `compute_commitment` is a no-op.
    Disabled,
    /// Touches buffer keys only; commitment re-reads current values.
    #[default]
    Direct,
    /// Touches also record per-key structured updates in-band.
    Update,
}

impl CommitmentMode {
    /// Parses a commitment-mode string: `"off"` maps to `Disabled`,
    /// `"update"` maps to `Update`, anything else maps to `Direct`.
    pub fn parse(s: &str) -> Self {
        match s {
            "off" => CommitmentMode::Disabled,
            "update" => CommitmentMode::Update,
            _ => CommitmentMode::Direct,
        }
    }
}

/// Default BPS-tree branching factor.
pub const DEFAULT_BPS_TREE_M: u64 = 2048;

/// Default Elias-Fano jump table period.
pub const DEFAULT_EF_JUMP_TABLE_PERIOD: u64 = 64;

/// Tunables for the archive/committed-domain subsystem.
#[derive(Clone, Copy, Debug)]
pub struct ArchiveConfig {
    /// Policy governing touch buffering and commitment computation.
    pub commitment_mode: CommitmentMode,
    /// `txNum` units per file generation; must be `> 0`.
    pub aggregation_step: u64,
    /// BPS-tree branching factor.
    pub bps_tree_m: u64,
    /// Elias-Fano jump table period (`Q`).
    pub ef_jump_table_period: u64,
}

impl ArchiveConfig {
    /// Builds a config with the section-6 defaults for `bps_tree_m` and
    /// `ef_jump_table_period`, the given aggregation step, and `Direct`
    /// commitment mode.
    pub fn new(aggregation_step: u64) -> Self {
        Self {
            commitment_mode: CommitmentMode::Direct,
            aggregation_step,
            bps_tree_m: DEFAULT_BPS_TREE_M,
            ef_jump_table_period: DEFAULT_EF_JUMP_TABLE_PERIOD,
        }
    }

    /// Builder method setting the commitment mode.
    pub fn with_commitment_mode(mut self, mode: CommitmentMode) -> Self {
        self.commitment_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commitment_mode() {
        assert_eq!(CommitmentMode::parse("off"), CommitmentMode::Disabled);
        assert_eq!(CommitmentMode::parse("update"), CommitmentMode::Update);
        assert_eq!(CommitmentMode::parse("direct"), CommitmentMode::Direct);
        assert_eq!(CommitmentMode::parse("anything"), CommitmentMode::Direct);
    }

    #[test]
    fn config_defaults() {
        let cfg = ArchiveConfig::new(16);
        assert_eq!(cfg.bps_tree_m, DEFAULT_BPS_TREE_M);
        assert_eq!(cfg.ef_jump_table_period, DEFAULT_EF_JUMP_TABLE_PERIOD);
        assert_eq!(cfg.commitment_mode, CommitmentMode::Direct);
    }
}
