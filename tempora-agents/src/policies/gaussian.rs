use crate::network::{ThreadSafeSequential, build_sequential};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, Module, VarBuilder, VarMap};
use rand::Rng;
use rand_distr::StandardNormal;
use tempora_core::agent::{Agent, Parameterized, StepContext};
use tempora_core::utils::ensure_finite;
use tempora_core::{Result, StreamKey, Workspace};

/// Diagonal gaussian policy over a continuous action space.
///
/// The standard deviation is the learned `log_std` parameter unless the execution params
/// carry a fixed `action_std`.
#[derive(Clone)]
pub struct GaussianPolicy {
    mu_net: ThreadSafeSequential,
    log_std: Var,
    varmap: VarMap,
    action_size: usize,
}

impl GaussianPolicy {
    pub fn build(
        observation_size: usize,
        hidden_layers: &[usize],
        action_size: usize,
        initial_log_std: f64,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let layers = [hidden_layers, &[action_size]].concat();
        let mu_net = build_sequential(observation_size, &layers, &vb, "policy")?;
        let log_std = varmap.get(
            action_size,
            "log_std",
            Init::Const(initial_log_std),
            DType::F32,
            device,
        )?;
        let log_std = Var::from_tensor(&log_std)?;
        Ok(Self {
            mu_net,
            log_std,
            varmap,
            action_size,
        })
    }

    pub fn action_size(&self) -> usize {
        self.action_size
    }

    fn log_std(&self, mu: &Tensor, action_std: Option<f32>) -> Result<Tensor> {
        let log_std = match action_std {
            Some(std) => Tensor::full(std.ln(), mu.shape(), mu.device())?,
            None => self.log_std.as_tensor().broadcast_as(mu.shape())?,
        };
        Ok(log_std)
    }

    fn noise(&self, mu: &Tensor, rng: &mut impl Rng) -> Result<Tensor> {
        let noise = (0..mu.elem_count())
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect::<Vec<_>>();
        Ok(Tensor::from_vec(noise, mu.shape(), mu.device())?)
    }
}

impl Agent for GaussianPolicy {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        let observation = workspace.get(&StreamKey::Observation, t)?;
        ensure_finite(observation, StreamKey::Observation).inspect_err(|_| {
            tracing::warn!(t, "non finite observation");
        })?;
        let mu = self.mu_net.forward(observation)?;
        let log_std = self.log_std(&mu, ctx.params.action_std)?;
        ensure_finite(&mu, StreamKey::Action)?;
        ensure_finite(&log_std, StreamKey::custom("log_std"))?;
        let scale = log_std.exp()?;
        let action = if ctx.params.replay {
            workspace.get(&StreamKey::Action, t)?.clone()
        } else {
            let action = if ctx.params.deterministic() {
                mu.detach()
            } else {
                let noise = self.noise(&mu, &mut *ctx.rng)?;
                (mu.detach() + scale.detach().mul(&noise)?)?
            };
            workspace.set(StreamKey::Action, t, action.clone())?;
            action
        };
        let log_sqrt_2pi = (2. * std::f64::consts::PI).sqrt().ln();
        let var = scale.sqr()?;
        let log_probs = (((action - &mu)?.sqr()? / (2. * var)?)?.neg()? - &log_std)?;
        let log_probs = (log_probs - log_sqrt_2pi)?.sum(1)?;
        let entropy = (log_std + 0.5 * ((2. * std::f64::consts::PI).ln() + 1.))?.sum(1)?;
        workspace.set(StreamKey::ActionLogprobs, t, log_probs)?;
        workspace.set(StreamKey::Entropy, t, entropy)?;
        Ok(())
    }
}

impl Parameterized for GaussianPolicy {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempora_core::TemporaError;
    use tempora_core::agent::ExecutionParams;

    fn step(
        policy: &mut GaussianPolicy,
        ws: &mut Workspace,
        params: ExecutionParams,
        seed: u64,
    ) -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ctx = StepContext {
            params,
            rng: &mut rng,
        };
        policy.forward(ws, 0, &mut ctx)?;
        Ok(())
    }

    #[test]
    fn deterministic_actions_have_the_mode_logprob() -> anyhow::Result<()> {
        let mut policy = GaussianPolicy::build(3, &[8], 2, 0., &Device::Cpu)?;
        let mut ws = Workspace::new();
        ws.set(
            StreamKey::Observation,
            0,
            Tensor::ones((4, 3), DType::F32, &Device::Cpu)?,
        )?;
        step(&mut policy, &mut ws, ExecutionParams::evaluation(), 0)?;
        assert_eq!(ws.get(&StreamKey::Action, 0)?.dims(), &[4, 2]);
        // at the mean with unit std every dimension contributes -ln(sqrt(2 pi))
        let expected = -2. * (2. * std::f32::consts::PI).sqrt().ln();
        let logprobs: Vec<f32> = ws.get(&StreamKey::ActionLogprobs, 0)?.to_vec1()?;
        assert!(logprobs.iter().all(|lp| (lp - expected).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn fixed_action_std_overrides_the_learned_one() -> anyhow::Result<()> {
        let mut policy = GaussianPolicy::build(3, &[8], 1, 0., &Device::Cpu)?;
        let mut ws = Workspace::new();
        ws.set(
            StreamKey::Observation,
            0,
            Tensor::ones((2, 3), DType::F32, &Device::Cpu)?,
        )?;
        let params = ExecutionParams::evaluation().with_action_std(Some(0.5));
        step(&mut policy, &mut ws, params, 0)?;
        let entropy: Vec<f32> = ws.get(&StreamKey::Entropy, 0)?.to_vec1()?;
        let expected = 0.5 * ((2. * std::f32::consts::PI).ln() + 1.) + 0.5f32.ln();
        assert!(entropy.iter().all(|h| (h - expected).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn replay_reuses_stored_actions() -> anyhow::Result<()> {
        let mut policy = GaussianPolicy::build(3, &[8], 2, -0.5, &Device::Cpu)?;
        let mut ws = Workspace::new();
        ws.set(
            StreamKey::Observation,
            0,
            Tensor::ones((3, 3), DType::F32, &Device::Cpu)?,
        )?;
        step(&mut policy, &mut ws, ExecutionParams::acquisition(), 4)?;
        let actions: Vec<Vec<f32>> = ws.get(&StreamKey::Action, 0)?.to_vec2()?;
        let logprobs: Vec<f32> = ws.get(&StreamKey::ActionLogprobs, 0)?.to_vec1()?;
        step(&mut policy, &mut ws, ExecutionParams::replay(), 5)?;
        let replayed: Vec<Vec<f32>> = ws.get(&StreamKey::Action, 0)?.to_vec2()?;
        let relogprobs: Vec<f32> = ws.get(&StreamKey::ActionLogprobs, 0)?.to_vec1()?;
        assert_eq!(actions, replayed);
        for (lhs, rhs) in logprobs.iter().zip(relogprobs) {
            assert!((lhs - rhs).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn nan_observations_are_reported() -> anyhow::Result<()> {
        let mut policy = GaussianPolicy::build(3, &[8], 1, 0., &Device::Cpu)?;
        let mut ws = Workspace::new();
        ws.set(
            StreamKey::Observation,
            0,
            Tensor::full(f32::NAN, (2, 3), &Device::Cpu)?,
        )?;
        let result = step(&mut policy, &mut ws, ExecutionParams::acquisition(), 0);
        let err = result.err().and_then(|err| err.downcast::<TemporaError>().ok());
        assert!(matches!(
            err,
            Some(TemporaError::NumericalInstability {
                key: StreamKey::Observation
            })
        ));
        assert!(!ws.contains(&StreamKey::Action));
        Ok(())
    }

    #[test]
    fn zero_action_std_is_reported() -> anyhow::Result<()> {
        let mut policy = GaussianPolicy::build(3, &[8], 1, 0., &Device::Cpu)?;
        let mut ws = Workspace::new();
        ws.set(
            StreamKey::Observation,
            0,
            Tensor::ones((2, 3), DType::F32, &Device::Cpu)?,
        )?;
        let params = ExecutionParams::acquisition().with_action_std(Some(0.));
        let result = step(&mut policy, &mut ws, params, 0);
        let err = result.err().and_then(|err| err.downcast::<TemporaError>().ok());
        assert!(matches!(
            err,
            Some(TemporaError::NumericalInstability { .. })
        ));
        Ok(())
    }
}
