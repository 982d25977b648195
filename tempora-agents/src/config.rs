use crate::stop::{LearningSchedule, StopCriterion};
use candle_core::Device;
use serde::Deserialize;
use tempora_core::{Result, TemporaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceConfig {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceConfig {
    pub fn resolve(&self) -> Result<Device> {
        let device = match self {
            Self::Cpu => Device::Cpu,
            Self::Cuda(ordinal) => Device::new_cuda(*ordinal)?,
            Self::Metal(ordinal) => Device::new_metal(*ordinal)?,
        };
        Ok(device)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PPOConfig {
    pub seed: u64,
    pub n_envs: usize,
    pub n_processes: usize,
    pub n_timesteps: usize,
    pub n_mini_batches: usize,
    pub n_times_per_minibatch: usize,
    pub n_envs_per_minibatch: usize,
    pub n_timesteps_per_minibatch: usize,
    pub clip_ratio: f32,
    pub discount_factor: f64,
    pub gae: f64,
    pub lr_policy: f64,
    pub lr_critic: f64,
    /// Bound on the policy gradient norm, a non positive value disables clipping.
    pub clip_grad: f32,
    pub reward_scaling: f64,
    /// Fixed exploration noise for continuous policies.
    pub action_std: Option<f32>,
    pub stop_criterion: StopCriterion,
    pub max_epochs: usize,
    pub max_steps: usize,
    pub time_limit: f64,
    pub acquisition_device: DeviceConfig,
    pub learning_device: DeviceConfig,
}

impl Default for PPOConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            n_envs: 8,
            n_processes: 1,
            n_timesteps: 20,
            n_mini_batches: 8,
            n_times_per_minibatch: 1,
            n_envs_per_minibatch: 4,
            n_timesteps_per_minibatch: 10,
            clip_ratio: 0.2,
            discount_factor: 0.99,
            gae: 0.95,
            lr_policy: 3e-4,
            lr_critic: 1e-3,
            clip_grad: 2.,
            reward_scaling: 1.,
            action_std: None,
            stop_criterion: StopCriterion::Epochs,
            max_epochs: 100,
            max_steps: 100_000,
            time_limit: 1000.,
            acquisition_device: DeviceConfig::Cpu,
            learning_device: DeviceConfig::Cpu,
        }
    }
}

impl PPOConfig {
    /// Rejects minibatch shapes that cannot be drawn from one rollout.
    pub fn validate(&self) -> Result<()> {
        if self.n_envs == 0 || self.n_processes == 0 || self.n_envs % self.n_processes != 0 {
            return Err(TemporaError::config(format!(
                "{} environments cannot be split over {} processes",
                self.n_envs, self.n_processes
            )));
        }
        if self.n_timesteps < 2 {
            return Err(TemporaError::config("a rollout needs at least 2 time steps"));
        }
        if self.n_envs_per_minibatch == 0 || self.n_envs_per_minibatch > self.n_envs {
            return Err(TemporaError::config(format!(
                "cannot draw {} environments per minibatch out of {}",
                self.n_envs_per_minibatch, self.n_envs
            )));
        }
        if self.n_timesteps_per_minibatch < 2 || self.n_timesteps_per_minibatch > self.n_timesteps
        {
            return Err(TemporaError::config(format!(
                "minibatch windows of {} steps do not fit rollouts of {} steps",
                self.n_timesteps_per_minibatch, self.n_timesteps
            )));
        }
        if self.n_times_per_minibatch == 0 {
            return Err(TemporaError::config("minibatches need at least one window"));
        }
        Ok(())
    }

    /// `time_unit` is only read by the time criterion.
    pub fn learning_schedule(&self, time_unit: f64) -> LearningSchedule {
        match self.stop_criterion {
            StopCriterion::Epochs => LearningSchedule::EpochBound {
                max_epochs: self.max_epochs,
            },
            StopCriterion::Steps => LearningSchedule::StepBound {
                max_steps: self.max_steps,
            },
            StopCriterion::Time => LearningSchedule::TimeBound {
                time_limit: self.time_limit,
                time_unit,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct A2CConfig {
    pub seed: u64,
    pub n_envs: usize,
    pub n_steps: usize,
    pub max_epochs: usize,
    pub discount_factor: f64,
    pub entropy_coef: f64,
    pub critic_coef: f64,
    pub a2c_coef: f64,
    pub lr: f64,
    pub max_grad_norm: f32,
    /// Interactions between two evaluations.
    pub eval_interval: usize,
    pub n_eval_envs: usize,
    pub hidden_layers: Vec<usize>,
    /// Skip the update of an epoch whose policy produced non finite values instead of failing.
    pub skip_unstable_epochs: bool,
    /// Where the units and the critic live, checked when the trainer is built.
    pub device: DeviceConfig,
}

impl Default for A2CConfig {
    fn default() -> Self {
        Self {
            seed: 2,
            n_envs: 8,
            n_steps: 200,
            max_epochs: 1000,
            discount_factor: 0.95,
            entropy_coef: 0.001,
            critic_coef: 1.,
            a2c_coef: 0.1,
            lr: 0.01,
            max_grad_norm: 0.5,
            eval_interval: 2000,
            n_eval_envs: 1,
            hidden_layers: vec![25, 25],
            skip_unstable_epochs: false,
            device: DeviceConfig::Cpu,
        }
    }
}

impl A2CConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_envs == 0 || self.n_eval_envs == 0 {
            return Err(TemporaError::config("at least one environment is needed"));
        }
        if self.n_steps < 2 {
            return Err(TemporaError::config("a rollout needs at least 2 time steps"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_minibatches_fit_the_rollout() {
        assert!(PPOConfig::default().validate().is_ok());
        assert!(A2CConfig::default().validate().is_ok());
    }

    #[test]
    fn oversized_minibatches_are_rejected() {
        let config = PPOConfig {
            n_envs_per_minibatch: 9,
            ..PPOConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TemporaError::Configuration(_))
        ));
        let config = PPOConfig {
            n_timesteps_per_minibatch: 21,
            ..PPOConfig::default()
        };
        assert!(config.validate().is_err());
        let config = PPOConfig {
            n_processes: 3,
            ..PPOConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn schedule_follows_the_criterion() {
        let config = PPOConfig {
            stop_criterion: StopCriterion::Steps,
            max_steps: 1000,
            ..PPOConfig::default()
        };
        assert_eq!(
            config.learning_schedule(1.),
            LearningSchedule::StepBound { max_steps: 1000 }
        );
    }
}
