//! Deterministic environments and agents for exercising the temporal protocol.

use crate::agent::{Agent, Parameterized, StepContext};
use crate::env::{Action, Env, EnvironmentDescription, SnapShot, Space};
use crate::error::Result;
use crate::workspace::{StreamKey, Workspace};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarMap};

/// Pays `rewards[k - 1]` on its `k`-th step and terminates on step `done_step`.
///
/// Observations are `[k, last_action]`, the reset observation is `[0, 0]` whatever the seed.
#[derive(Debug, Clone)]
pub struct ScriptedEnv {
    rewards: Vec<f32>,
    done_step: usize,
    step: usize,
    reports_success: bool,
}

impl ScriptedEnv {
    pub fn new(rewards: Vec<f32>, done_step: usize) -> Self {
        Self {
            rewards,
            done_step,
            step: 0,
            reports_success: false,
        }
    }

    /// Reports success on the terminal step.
    pub fn reporting_success(mut self) -> Self {
        self.reports_success = true;
        self
    }

    pub fn initial_observation() -> Vec<f32> {
        vec![0., 0.]
    }
}

impl Env for ScriptedEnv {
    fn reset(&mut self, _seed: u64) -> Result<Vec<f32>> {
        self.step = 0;
        Ok(Self::initial_observation())
    }

    fn step(&mut self, action: Action<'_>) -> Result<SnapShot> {
        self.step += 1;
        let action = match action {
            Action::Discrete(action) => action as f32,
            Action::Continuous(action) => action.iter().sum(),
        };
        let terminated = self.step >= self.done_step;
        Ok(SnapShot {
            state: vec![self.step as f32, action],
            reward: self.rewards.get(self.step - 1).copied().unwrap_or(0.),
            terminated,
            truncated: false,
            success: (self.reports_success && terminated).then_some(true),
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(Space::continuous_from_dims(&[2]), Space::Discrete(2))
    }
}

/// Always takes the same discrete action.
///
/// When built with [`ConstantPolicy::parameterized`] the action is read from the `action`
/// parameter instead, so weight synchronization can be observed through the environment.
#[derive(Clone)]
pub struct ConstantPolicy {
    action: u32,
    varmap: VarMap,
}

impl ConstantPolicy {
    pub fn discrete(action: u32) -> Self {
        Self {
            action,
            varmap: VarMap::new(),
        }
    }

    pub fn parameterized(action: u32) -> Result<Self> {
        let varmap = VarMap::new();
        varmap.get(1, "action", Init::Const(action as f64), DType::F32, &Device::Cpu)?;
        Ok(Self { action, varmap })
    }

    fn current_action(&self) -> Result<u32> {
        let vars = self.varmap.all_vars();
        match vars.first() {
            Some(var) => Ok(var.as_tensor().to_vec1::<f32>()?[0].round() as u32),
            None => Ok(self.action),
        }
    }
}

impl Agent for ConstantPolicy {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        if ctx.params.replay {
            return Ok(());
        }
        let obs = workspace.get(&StreamKey::Observation, t)?;
        let (n_envs, device) = (obs.dim(0)?, obs.device().clone());
        let action = Tensor::full(self.current_action()?, n_envs, &device)?;
        workspace.set(StreamKey::Action, t, action)?;
        workspace.set(
            StreamKey::ActionLogprobs,
            t,
            Tensor::zeros(n_envs, DType::F32, &device)?,
        )
    }
}

impl Parameterized for ConstantPolicy {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

/// Writes `t` into a custom stream and records every call.
#[derive(Debug, Clone)]
pub struct CountingAgent {
    key: StreamKey,
    calls: Vec<usize>,
    replays: usize,
}

impl CountingAgent {
    pub fn new(key: StreamKey) -> Self {
        Self {
            key,
            calls: vec![],
            replays: 0,
        }
    }

    pub fn calls(&self) -> Vec<usize> {
        self.calls.clone()
    }

    pub fn replays(&self) -> usize {
        self.replays
    }
}

impl Agent for CountingAgent {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        self.calls.push(t);
        if ctx.params.replay {
            self.replays += 1;
        }
        workspace.set(
            self.key.clone(),
            t,
            Tensor::new(&[t as f32], &Device::Cpu)?,
        )
    }
}
