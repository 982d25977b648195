use super::{Action, Env, EnvBuilder, EnvironmentDescription, Space};
use crate::agent::{Agent, StepContext};
use crate::error::{Result, TemporaError};
use crate::workspace::{StreamKey, Workspace};
use candle_core::{DType, Device, Tensor};
use rand::Rng;

/// What happens to an environment on the step after it reported `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Restart in place with a fresh episode.
    Auto,
    /// Hold the terminal observation, reward and done flag.
    NoAuto,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    state: Vec<f32>,
    reward: f32,
    done: bool,
    cumulated_reward: f32,
    timestep: u32,
    success: Option<bool>,
}

impl Slot {
    fn fresh(state: Vec<f32>) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }
}

/// Steps a batch of environments and writes their outputs into the workspace.
///
/// At `t = 0` every environment is reset. At `t > 0` the agent consumes `action[t - 1]` and
/// writes `env/env_obs`, `env/reward`, `env/done`, `env/cumulated_reward` and `env/timestep`
/// at `t`, plus `env/success` for environments reporting it.
pub struct EnvAgent<E: Env> {
    envs: Vec<E>,
    slots: Vec<Slot>,
    mode: ResetMode,
    description: EnvironmentDescription,
    device: Device,
    reports_success: bool,
}

impl<E: Env> EnvAgent<E> {
    pub fn new(envs: Vec<E>, mode: ResetMode) -> Result<Self> {
        let Some(first) = envs.first() else {
            return Err(TemporaError::config("an env agent needs at least one environment"));
        };
        let description = first.env_description();
        Ok(Self {
            slots: vec![Slot::default(); envs.len()],
            envs,
            mode,
            description,
            device: Device::Cpu,
            reports_success: false,
        })
    }

    pub fn auto_reset(envs: Vec<E>) -> Result<Self> {
        Self::new(envs, ResetMode::Auto)
    }

    pub fn no_auto_reset(envs: Vec<E>) -> Result<Self> {
        Self::new(envs, ResetMode::NoAuto)
    }

    pub fn from_builder<B: EnvBuilder<Env = E>>(
        builder: &B,
        n_envs: usize,
        mode: ResetMode,
    ) -> Result<Self> {
        let envs = (0..n_envs)
            .map(|_| builder.build_env())
            .collect::<Result<Vec<_>>>()?;
        Self::new(envs, mode)
    }

    /// Device the written tensors live on.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn n_envs(&self) -> usize {
        self.envs.len()
    }

    pub fn mode(&self) -> ResetMode {
        self.mode
    }

    pub fn env_description(&self) -> &EnvironmentDescription {
        &self.description
    }

    fn reset_all(&mut self, rng: &mut impl Rng) -> Result<()> {
        for (env, slot) in self.envs.iter_mut().zip(self.slots.iter_mut()) {
            *slot = Slot::fresh(env.reset(rng.random())?);
        }
        Ok(())
    }

    fn actions(&self, workspace: &Workspace, t: usize) -> Result<Vec<Vec<f32>>> {
        let actions = workspace
            .get(&StreamKey::Action, t)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let n_envs = self.envs.len();
        let rows = match &self.description.action_space {
            Space::Discrete(_) => actions.reshape((n_envs, 1))?.to_vec2()?,
            Space::Continuous { size, .. } => actions.reshape((n_envs, *size))?.to_vec2()?,
        };
        Ok(rows)
    }

    fn step_all(&mut self, actions: Vec<Vec<f32>>, rng: &mut impl Rng) -> Result<()> {
        let discrete = self.description.action_space.is_discrete();
        for (env_idx, ((env, slot), action)) in self
            .envs
            .iter_mut()
            .zip(self.slots.iter_mut())
            .zip(actions)
            .enumerate()
        {
            if slot.done {
                match self.mode {
                    ResetMode::Auto => {
                        tracing::trace!(env_idx, "auto reset");
                        *slot = Slot::fresh(env.reset(rng.random())?);
                    }
                    ResetMode::NoAuto => {}
                }
                continue;
            }
            let action = if discrete {
                Action::Discrete(action[0] as usize)
            } else {
                Action::Continuous(&action)
            };
            let snapshot = env.step(action)?;
            slot.done = snapshot.done();
            slot.state = snapshot.state;
            slot.reward = snapshot.reward;
            slot.cumulated_reward += snapshot.reward;
            slot.timestep += 1;
            slot.success = snapshot.success;
        }
        Ok(())
    }

    fn write(&mut self, workspace: &mut Workspace, t: usize) -> Result<()> {
        let n_envs = self.slots.len();
        let obs_size = self.description.observation_size();
        let states = self
            .slots
            .iter()
            .flat_map(|slot| slot.state.iter().copied())
            .collect::<Vec<_>>();
        if states.len() != n_envs * obs_size {
            return Err(TemporaError::shape(format!(
                "environments returned {} observation values, expected {n_envs} x {obs_size}",
                states.len()
            )));
        }
        let device = &self.device;
        let column = |values: Vec<f32>| Tensor::from_vec(values, n_envs, device);
        workspace.set(
            StreamKey::Observation,
            t,
            Tensor::from_vec(states, (n_envs, obs_size), device)?,
        )?;
        workspace.set(
            StreamKey::Reward,
            t,
            column(self.slots.iter().map(|slot| slot.reward).collect())?,
        )?;
        workspace.set(
            StreamKey::Done,
            t,
            Tensor::from_vec(
                self.slots.iter().map(|slot| slot.done as u8).collect::<Vec<_>>(),
                n_envs,
                device,
            )?,
        )?;
        workspace.set(
            StreamKey::CumulatedReward,
            t,
            column(self.slots.iter().map(|slot| slot.cumulated_reward).collect())?,
        )?;
        workspace.set(
            StreamKey::Timestep,
            t,
            Tensor::from_vec(
                self.slots.iter().map(|slot| slot.timestep).collect::<Vec<_>>(),
                n_envs,
                device,
            )?,
        )?;
        self.reports_success |= self.slots.iter().any(|slot| slot.success.is_some());
        if self.reports_success {
            let success = self
                .slots
                .iter()
                .map(|slot| if slot.success == Some(true) { 1. } else { 0. })
                .collect();
            workspace.set(StreamKey::Success, t, column(success)?)?;
        }
        Ok(())
    }
}

impl<E: Env> Agent for EnvAgent<E> {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        if ctx.params.replay {
            return Ok(());
        }
        if t == 0 {
            self.reset_all(&mut *ctx.rng)?;
        } else {
            let actions = self.actions(workspace, t - 1)?;
            self.step_all(actions, &mut *ctx.rng)?;
        }
        self.write(workspace, t)
    }
}
