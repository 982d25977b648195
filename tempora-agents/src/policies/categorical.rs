use crate::network::{ThreadSafeSequential, build_sequential};
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::{log_softmax, softmax};
use candle_nn::{Module, VarBuilder, VarMap};
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use tempora_core::agent::{Agent, Parameterized, StepContext};
use tempora_core::utils::ensure_finite;
use tempora_core::{Result, StreamKey, TemporaError, Workspace};

/// Softmax policy over a discrete action space.
///
/// Writes `action_probs`, `entropy` and `action_logprobs` at every call, plus `action` unless
/// replaying, in which case the log-probabilities of the stored actions are recomputed.
#[derive(Clone)]
pub struct CategoricalPolicy {
    logits: ThreadSafeSequential,
    varmap: VarMap,
    n_actions: usize,
}

impl CategoricalPolicy {
    pub fn build(
        observation_size: usize,
        hidden_layers: &[usize],
        n_actions: usize,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let layers = [hidden_layers, &[n_actions]].concat();
        let logits = build_sequential(observation_size, &layers, &vb, "policy")?;
        Ok(Self {
            logits,
            varmap,
            n_actions,
        })
    }

    pub fn n_actions(&self) -> usize {
        self.n_actions
    }

    fn sample(&self, probs: &Tensor, ctx: &mut StepContext<'_>) -> Result<Tensor> {
        if ctx.params.deterministic() {
            return Ok(probs.argmax(1)?);
        }
        let rows: Vec<Vec<f32>> = probs.to_vec2()?;
        let actions = rows
            .iter()
            .map(|row| {
                let distribution = WeightedIndex::new(row).map_err(|_| {
                    TemporaError::NumericalInstability {
                        key: StreamKey::ActionProbs,
                    }
                })?;
                Ok(distribution.sample(&mut *ctx.rng) as u32)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::from_vec(actions, rows.len(), probs.device())?)
    }
}

impl Agent for CategoricalPolicy {
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
        let logits = self.logits.forward(observation)?;
        ensure_finite(&logits, StreamKey::ActionProbs).inspect_err(|_| {
            tracing::warn!(t, "non finite action logits");
        })?;
        let probs = softmax(&logits, 1)?;
        let log_probs = log_softmax(&logits, 1)?;
        let entropy = probs.mul(&log_probs)?.sum(1)?.neg()?;
        let action = if ctx.params.replay {
            workspace.get(&StreamKey::Action, t)?.to_dtype(DType::U32)?
        } else {
            let action = self.sample(&probs.detach(), ctx)?;
            workspace.set(StreamKey::Action, t, action.clone())?;
            action
        };
        let action_logprobs = log_probs.gather(&action.unsqueeze(1)?, 1)?.squeeze(1)?;
        workspace.set(StreamKey::ActionProbs, t, probs)?;
        workspace.set(StreamKey::Entropy, t, entropy)?;
        workspace.set(StreamKey::ActionLogprobs, t, action_logprobs)?;
        Ok(())
    }
}

impl Parameterized for CategoricalPolicy {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}
