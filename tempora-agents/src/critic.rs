use crate::network::{ThreadSafeSequential, build_sequential};
use candle_core::{DType, Device};
use candle_nn::{Module, VarBuilder, VarMap};
use tempora_core::agent::{Agent, Parameterized, StepContext};
use tempora_core::{Result, StreamKey, Workspace};

/// State value function writing `critic` for every environment.
#[derive(Clone)]
pub struct CriticAgent {
    value_net: ThreadSafeSequential,
    varmap: VarMap,
}

impl CriticAgent {
    pub fn build(
        observation_size: usize,
        hidden_layers: &[usize],
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let layers = [hidden_layers, &[1]].concat();
        let value_net = build_sequential(observation_size, &layers, &vb, "critic")?;
        Ok(Self { value_net, varmap })
    }
}

impl Agent for CriticAgent {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        _ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        let observation = workspace.get(&StreamKey::Observation, t)?;
        let values = self.value_net.forward(observation)?.squeeze(1)?;
        workspace.set(StreamKey::Critic, t, values)
    }
}

impl Parameterized for CriticAgent {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempora_core::agent::ExecutionParams;

    #[test]
    fn values_keep_their_gradient() -> anyhow::Result<()> {
        let mut critic = CriticAgent::build(2, &[4], &Device::Cpu)?;
        let mut ws = Workspace::new();
        ws.set(
            StreamKey::Observation,
            0,
            Tensor::ones((3, 2), DType::F32, &Device::Cpu)?,
        )?;
        let mut rng = StdRng::seed_from_u64(0);
        let mut ctx = StepContext {
            params: ExecutionParams::replay(),
            rng: &mut rng,
        };
        critic.forward(&mut ws, 0, &mut ctx)?;
        let values = ws.get(&StreamKey::Critic, 0)?;
        assert_eq!(values.dims(), &[3]);
        let grads = values.sum_all()?.backward()?;
        let vars = critic.parameters();
        assert!(vars.iter().all(|var| grads.get(var.as_tensor()).is_some()));
        Ok(())
    }
}
