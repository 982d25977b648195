use crate::actor_critic::ActorCritic;
use crate::config::PPOConfig;
use crate::losses::{Advantages, PolicyLoss, ValueLoss, clipped_surrogate, squared_td};
use crate::stop::{StopCriterion, TrainingReport};
use candle_core::{Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Instant;
use tempora_core::advantage::{gae, temporal_difference};
use tempora_core::agent::{ExecutionParams, Parameterized, StopCondition, TemporalAgent};
use tempora_core::coordinator::{Acquisition, UnitBuilder};
use tempora_core::logger::Logger;
use tempora_core::utils::{
    clip_grad_norm, compute_time_unit, ensure_finite, ensure_on_device, grad_norm, masked_mean,
};
use tempora_core::{Result, StreamKey, TemporaError, Workspace};

pub struct PPOLosses {
    pub policy_loss: PolicyLoss,
    pub value_loss: ValueLoss,
}

/// PPO losses of a replayed minibatch.
///
/// Expects `critic`, `action_logprobs` and `old_action_logprobs` to be present. The ratio and
/// advantage at the last time index are dropped since that step only carries the bootstrap value.
pub fn ppo_losses(minibatch: &Workspace, config: &PPOConfig) -> Result<PPOLosses> {
    let critic = minibatch.get_full(&StreamKey::Critic)?;
    let done = minibatch.get_full(&StreamKey::Done)?;
    let reward = (minibatch.get_full(&StreamKey::Reward)? * config.reward_scaling)?;
    let advantages = Advantages(gae(
        &critic,
        &reward,
        &done,
        config.discount_factor,
        config.gae,
    )?);
    let time_size = critic.dim(0)?;
    let logprobs = minibatch.get_range(&StreamKey::ActionLogprobs, 0, time_size - 1)?;
    let old_logprobs = minibatch.get_range(&StreamKey::OldActionLogprobs, 0, time_size - 1)?;
    let ratio = (logprobs - old_logprobs)?.exp()?;
    let policy_loss = clipped_surrogate(&ratio, &advantages, config.clip_ratio)?;
    let td = temporal_difference(&critic, &reward, &done, config.discount_factor)?;
    let value_loss = squared_td(&td)?;
    Ok(PPOLosses {
        policy_loss,
        value_loss,
    })
}

fn adam(vars: Vec<Var>, lr: f64) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr,
        weight_decay: 0.,
        ..ParamsAdamW::default()
    };
    Ok(AdamW::new(vars, params)?)
}

/// Clipped surrogate PPO with decoupled policy and critic optimizers.
///
/// Acquisition runs on copies of the policy (in process or on worker threads) that are
/// refreshed from the trained policy at the start of every epoch.
pub struct PPO {
    config: PPOConfig,
    acquisition: Acquisition,
    train_agent: TemporalAgent<ActorCritic>,
    optimizer_policy: AdamW,
    optimizer_critic: AdamW,
    rng: StdRng,
    learning_device: Device,
    logger: Box<dyn Logger>,
}

impl PPO {
    /// `actor_critic` has to live on the configured learning device.
    pub fn new(
        config: PPOConfig,
        acquisition: Acquisition,
        actor_critic: ActorCritic,
        logger: impl Logger + 'static,
    ) -> Result<Self> {
        config.validate()?;
        if acquisition.n_workers() != config.n_processes {
            return Err(TemporaError::config(format!(
                "acquisition runs on {} workers, {} processes are configured",
                acquisition.n_workers(),
                config.n_processes
            )));
        }
        let learning_device = config.learning_device.resolve()?;
        ensure_on_device(&actor_critic.parameters(), &learning_device)?;
        let optimizer_policy = adam(actor_critic.policy_parameters(), config.lr_policy)?;
        let optimizer_critic = adam(actor_critic.critic_parameters(), config.lr_critic)?;
        Ok(Self {
            train_agent: TemporalAgent::new(actor_critic, config.seed),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            acquisition,
            optimizer_policy,
            optimizer_critic,
            learning_device,
            logger: Box::new(logger),
        })
    }

    /// Spawns the acquisition side from `builder` on the configured acquisition device.
    pub fn build<B: UnitBuilder>(
        config: PPOConfig,
        builder: &B,
        actor_critic: ActorCritic,
        logger: impl Logger + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let device = config.acquisition_device.resolve()?;
        let acquisition = Acquisition::build(builder, config.n_envs, config.n_processes, &device)?;
        Self::new(config, acquisition, actor_critic, logger)
    }

    pub fn config(&self) -> &PPOConfig {
        &self.config
    }

    pub fn actor_critic(&self) -> &ActorCritic {
        self.train_agent.agent()
    }

    pub fn train(&mut self) -> Result<TrainingReport> {
        let time_unit = match self.config.stop_criterion {
            StopCriterion::Time => {
                let time_unit = compute_time_unit(&self.learning_device)?;
                self.logger
                    .message(&format!("Time unit is {time_unit} seconds."));
                time_unit
            }
            _ => 1.,
        };
        let schedule = self.config.learning_schedule(time_unit);
        self.acquisition.seed(self.config.seed)?;
        let start = Instant::now();
        let (mut epoch, mut iteration, mut n_interactions) = (0, 0, 0);
        loop {
            let mut workspace = self.acquire(epoch)?;
            n_interactions += (workspace.time_size() - 1) * workspace.batch_size();
            self.logger
                .add_scalar("monitor/n_interactions", n_interactions as f64, epoch);
            self.log_episodes(&workspace, epoch)?;

            let old_logprobs = workspace.get_full(&StreamKey::ActionLogprobs)?;
            workspace.set_full(StreamKey::OldActionLogprobs, old_logprobs)?;

            let building = Instant::now();
            let mut minibatches = Vec::with_capacity(self.config.n_mini_batches);
            for _ in 0..self.config.n_mini_batches {
                minibatches.push(workspace.sample_subworkspace(
                    self.config.n_times_per_minibatch,
                    self.config.n_envs_per_minibatch,
                    self.config.n_timesteps_per_minibatch,
                    &mut self.rng,
                )?);
            }
            self.logger.add_scalar(
                "monitor/minibatches_building_time",
                building.elapsed().as_secs_f64(),
                epoch,
            );

            for mut minibatch in minibatches {
                self.update(&mut minibatch, iteration)?;
                iteration += 1;
            }
            epoch += 1;
            tracing::info!(epoch, n_interactions, iteration, "ppo epoch done");
            if !schedule.keep_going(epoch, n_interactions, start.elapsed()) {
                break;
            }
        }
        let report = TrainingReport {
            n_epochs: epoch,
            training_time: start.elapsed(),
            n_interactions,
        };
        self.acquisition.close()?;
        Ok(report)
    }

    // Fresh rollout on the first epoch, afterwards the last step is carried over and
    // `n_timesteps - 1` new steps are collected.
    fn acquire(&mut self, epoch: usize) -> Result<Workspace> {
        let snapshot = self.train_agent.agent().policy.state_dict()?;
        self.acquisition.load_policy(&snapshot)?;
        let params = ExecutionParams::acquisition().with_action_std(self.config.action_std);
        let (t, n_steps) = match epoch {
            0 => (0, self.config.n_timesteps),
            _ => (1, self.config.n_timesteps - 1),
        };
        let workspace = self
            .acquisition
            .rollout(t, &StopCondition::Steps(n_steps), params)?;
        Ok(workspace.to_device(&self.learning_device)?.detach())
    }

    fn log_episodes(&mut self, workspace: &Workspace, epoch: usize) -> Result<()> {
        let done = workspace.get_full(&StreamKey::Done)?;
        let cumulated_reward = workspace.get_full(&StreamKey::CumulatedReward)?;
        let Some(avg_reward) = masked_mean(&cumulated_reward, &done)? else {
            return Ok(());
        };
        self.logger
            .add_scalar("monitor/avg_training_reward", avg_reward, epoch);
        if workspace.contains(&StreamKey::Success) {
            let success = workspace.get_full(&StreamKey::Success)?;
            if let Some(success) = masked_mean(&success, &done)? {
                self.logger.add_scalar("monitor/success", success, epoch);
            }
        }
        Ok(())
    }

    fn update(&mut self, minibatch: &mut Workspace, iteration: usize) -> Result<()> {
        let params = ExecutionParams::replay().with_action_std(self.config.action_std);
        self.train_agent.replay(minibatch, params)?;
        let PPOLosses {
            policy_loss,
            value_loss,
        } = ppo_losses(minibatch, &self.config)?;
        let loss = policy_loss.add(&value_loss)?;
        ensure_finite(&loss, StreamKey::custom("loss")).inspect_err(|_| {
            tracing::warn!(iteration, "non finite ppo loss");
        })?;
        let mut grads = loss.backward()?;
        let actor_critic = self.train_agent.agent();
        let grad_norm_policy = clip_grad_norm(
            &mut grads,
            &actor_critic.policy_parameters(),
            self.config.clip_grad,
        )?;
        let grad_norm_critic = grad_norm(&grads, &actor_critic.critic_parameters())?;
        self.optimizer_policy.step(&grads)?;
        self.optimizer_critic.step(&grads)?;

        let policy_loss = policy_loss.to_scalar::<f32>()? as f64;
        let value_loss = value_loss.to_scalar::<f32>()? as f64;
        self.logger
            .add_scalar("monitor/grad_norm_policy", grad_norm_policy as f64, iteration);
        self.logger.add_scalar("loss/policy", policy_loss, iteration);
        self.logger.add_scalar("loss/critic", value_loss, iteration);
        self.logger
            .add_scalar("monitor/grad_norm_critic", grad_norm_critic as f64, iteration);
        tracing::debug!(iteration, policy_loss, value_loss, "ppo minibatch");
        Ok(())
    }
}
