use anyhow::{Context, Result};

use crate::color_utils::symbols;
use crate::config::{EnsembleConfig, MemberConfig};
use crate::fcn::{HeatmapPredictor, OnnxFcn};

/// One voting model: a heatmap predictor and its receptive field.
pub struct EnsembleMember {
    pub name: String,
    pub kernel_size: u32,
    pub predictor: Box<dyn HeatmapPredictor>,
}

impl EnsembleMember {
    pub fn new(
        name: impl Into<String>,
        kernel_size: u32,
        predictor: Box<dyn HeatmapPredictor>,
    ) -> Self {
        Self {
            name: name.into(),
            kernel_size,
            predictor,
        }
    }

    /// Load an ONNX FCN described by `config`.
    pub fn from_config(config: &MemberConfig, device: &str) -> Result<Self> {
        let fcn = OnnxFcn::load(&config.path, config.preprocessing, config.layout, device)
            .with_context(|| format!("Failed to load ensemble member '{}'", config.name))?;
        Ok(Self::new(&config.name, config.kernel_size, Box::new(fcn)))
    }
}

impl std::fmt::Debug for EnsembleMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsembleMember")
            .field("name", &self.name)
            .field("kernel_size", &self.kernel_size)
            .finish_non_exhaustive()
    }
}

/// Ordered, non-empty set of FCNs. The first member defines the heatmap grid
/// at every scale.
#[derive(Debug)]
pub struct Ensemble {
    members: Vec<EnsembleMember>,
}

impl Ensemble {
    pub fn new(members: Vec<EnsembleMember>) -> Result<Self> {
        if members.is_empty() {
            return Err(anyhow::anyhow!("Ensemble must contain at least one member"));
        }
        if let Some(m) = members.iter().find(|m| m.kernel_size == 0) {
            return Err(anyhow::anyhow!("Member '{}' has a zero kernel size", m.name));
        }
        Ok(Self { members })
    }

    /// Create ONNX sessions for every configured member.
    pub fn load(config: &EnsembleConfig, device: &str) -> Result<Self> {
        config.validate()?;
        let members = config
            .members
            .iter()
            .map(|member| {
                let loaded = EnsembleMember::from_config(member, device)?;
                log::info!(
                    "{} Loaded {} (kernel {})",
                    symbols::model_loaded(),
                    member.name,
                    member.kernel_size
                );
                Ok(loaded)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(members)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    pub fn members_mut(&mut self) -> &mut [EnsembleMember] {
        &mut self.members
    }

    /// Kernel of the member whose grid the others are aligned to.
    pub fn grid_kernel(&self) -> u32 {
        self.members[0].kernel_size
    }
}
