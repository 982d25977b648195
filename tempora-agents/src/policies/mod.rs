pub mod categorical;
pub mod gaussian;

pub use categorical::CategoricalPolicy;
pub use gaussian::GaussianPolicy;

use candle_core::Device;
use candle_nn::VarMap;
use tempora_core::Result;
use tempora_core::Workspace;
use tempora_core::agent::{Agent, Parameterized, StepContext};
use tempora_core::env::{EnvironmentDescription, Space};

/// Policy picked from the shape of the action space.
#[derive(Clone)]
pub enum PolicyKind {
    Categorical(CategoricalPolicy),
    Gaussian(GaussianPolicy),
}

impl PolicyKind {
    /// Categorical policy for a discrete action space, gaussian with a learned `log_std`
    /// starting at zero otherwise.
    pub fn build(
        description: &EnvironmentDescription,
        hidden_layers: &[usize],
        device: &Device,
    ) -> Result<Self> {
        let observation_size = description.observation_size();
        match &description.action_space {
            Space::Discrete(n_actions) => Ok(Self::Categorical(CategoricalPolicy::build(
                observation_size,
                hidden_layers,
                *n_actions,
                device,
            )?)),
            Space::Continuous { size, .. } => Ok(Self::Gaussian(GaussianPolicy::build(
                observation_size,
                hidden_layers,
                *size,
                0.,
                device,
            )?)),
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, Self::Categorical(_))
    }
}

impl Agent for PolicyKind {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        match self {
            Self::Categorical(policy) => policy.forward(workspace, t, ctx),
            Self::Gaussian(policy) => policy.forward(workspace, t, ctx),
        }
    }
}

impl Parameterized for PolicyKind {
    fn varmap(&self) -> &VarMap {
        match self {
            Self::Categorical(policy) => policy.varmap(),
            Self::Gaussian(policy) => policy.varmap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_space_selects_the_policy() -> anyhow::Result<()> {
        let discrete =
            EnvironmentDescription::new(Space::continuous_from_dims(&[4]), Space::Discrete(2));
        let policy = PolicyKind::build(&discrete, &[8], &Device::Cpu)?;
        assert!(policy.is_discrete());
        let continuous = EnvironmentDescription::new(
            Space::continuous_from_dims(&[3]),
            Space::continuous_from_dims(&[1]),
        );
        let policy = PolicyKind::build(&continuous, &[8], &Device::Cpu)?;
        assert!(!policy.is_discrete());
        // two linear layers plus log_std
        assert_eq!(policy.parameters().len(), 5);
        Ok(())
    }
}
