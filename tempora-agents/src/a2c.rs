use crate::config::A2CConfig;
use crate::critic::CriticAgent;
use crate::losses::{index_3d, squared_td};
use crate::stop::TrainingReport;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use std::time::Instant;
use tempora_core::advantage::temporal_difference;
use tempora_core::agent::{
    AcquisitionUnit, ExecutionParams, Parameterized, StopCondition, TemporalAgent,
};
use tempora_core::logger::Logger;
use tempora_core::utils::{clip_grad_norm, ensure_finite, ensure_on_device};
use tempora_core::{Result, StreamKey, TemporaError, Workspace};

pub struct A2CLosses {
    pub critic_loss: Tensor,
    pub entropy_loss: Tensor,
    pub a2c_loss: Tensor,
}

impl A2CLosses {
    /// `-entropy_coef * entropy + critic_coef * critic - a2c_coef * a2c`
    pub fn total(&self, config: &A2CConfig) -> Result<Tensor> {
        let loss = ((&self.critic_loss * config.critic_coef)?
            - (&self.entropy_loss * config.entropy_coef)?)?;
        Ok((loss - (&self.a2c_loss * config.a2c_coef)?)?)
    }
}

/// Advantage actor critic losses over a whole rollout, the critic having been run on it.
///
/// Discrete policies are weighted by the log of the probability they gave to the taken action,
/// continuous ones by the stored log-probabilities. The TD error weighting is detached.
pub fn a2c_losses(workspace: &Workspace, discount_factor: f64) -> Result<A2CLosses> {
    let critic = workspace.get_full(&StreamKey::Critic)?;
    let done = workspace.get_full(&StreamKey::Done)?;
    let reward = workspace.get_full(&StreamKey::Reward)?;
    let td = temporal_difference(&critic, &reward, &done, discount_factor)?;
    let critic_loss = squared_td(&td)?.0;
    let time_size = critic.dim(0)?;
    let action_logp = if workspace.contains(&StreamKey::ActionProbs) {
        let action_probs = workspace.get_full(&StreamKey::ActionProbs)?;
        let action = workspace.get_full(&StreamKey::Action)?;
        index_3d(&action_probs, &action)?.log()?
    } else {
        workspace.get_full(&StreamKey::ActionLogprobs)?
    };
    let a2c_loss = action_logp
        .narrow(0, 0, time_size - 1)?
        .mul(&td.detach())?
        .mean_all()?;
    let entropy_loss = workspace.get_full(&StreamKey::Entropy)?.mean_all()?;
    Ok(A2CLosses {
        critic_loss,
        entropy_loss,
        a2c_loss,
    })
}

/// Single optimizer advantage actor critic, learning from the rollout it just collected.
///
/// The evaluation unit steps its own environments without auto reset and receives the trained
/// weights before every evaluation.
pub struct A2C {
    config: A2CConfig,
    train_agent: TemporalAgent<AcquisitionUnit>,
    eval_agent: TemporalAgent<AcquisitionUnit>,
    critic_agent: TemporalAgent<CriticAgent>,
    vars: Vec<Var>,
    optimizer: AdamW,
    workspace: Workspace,
    logger: Box<dyn Logger>,
}

impl A2C {
    /// The units and the critic have to be built on the configured device.
    pub fn new(
        config: A2CConfig,
        train_unit: AcquisitionUnit,
        eval_unit: AcquisitionUnit,
        critic: CriticAgent,
        logger: impl Logger + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let device = config.device.resolve()?;
        let mut vars = train_unit.parameters();
        vars.extend(critic.parameters());
        ensure_on_device(&vars, &device)?;
        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: 0.,
            ..ParamsAdamW::default()
        };
        let optimizer = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            train_agent: TemporalAgent::new(train_unit, config.seed),
            eval_agent: TemporalAgent::new(eval_unit, config.seed + 1),
            critic_agent: TemporalAgent::new(critic, config.seed),
            config,
            vars,
            optimizer,
            workspace: Workspace::new(),
            logger: Box::new(logger),
        })
    }

    pub fn config(&self) -> &A2CConfig {
        &self.config
    }

    pub fn train(&mut self) -> Result<TrainingReport> {
        let start = Instant::now();
        let (mut nb_steps, mut tmp_steps) = (0, 0);
        for epoch in 0..self.config.max_epochs {
            match self.epoch(epoch, nb_steps + self.config.n_steps * self.config.n_envs) {
                Ok(()) => {}
                Err(TemporaError::NumericalInstability { key })
                    if self.config.skip_unstable_epochs =>
                {
                    tracing::warn!(epoch, %key, "skipping unstable epoch");
                    self.logger
                        .message(&format!("epoch {epoch} skipped: non finite values in `{key}`"));
                    // the partial rollout cannot be continued
                    self.workspace = Workspace::new();
                }
                Err(err) => return Err(err),
            }
            nb_steps += self.config.n_steps * self.config.n_envs;
            if nb_steps - tmp_steps > self.config.eval_interval {
                tmp_steps = nb_steps;
                let reward = self.evaluate()?;
                self.logger.add_scalar("reward", reward, nb_steps);
                tracing::info!(epoch, reward, "a2c evaluation");
            }
        }
        Ok(TrainingReport {
            n_epochs: self.config.max_epochs,
            training_time: start.elapsed(),
            n_interactions: nb_steps,
        })
    }

    fn acquire(&mut self) -> Result<()> {
        let params = ExecutionParams::acquisition();
        let n_steps = self.config.n_steps;
        let (t, n_steps) = if self.workspace.is_empty() {
            (0, n_steps)
        } else {
            self.workspace = self.workspace.detach().copy_n_last_steps(1)?;
            (1, n_steps - 1)
        };
        self.train_agent
            .execute(&mut self.workspace, t, &StopCondition::Steps(n_steps), params)?;
        self.critic_agent
            .replay(&mut self.workspace, ExecutionParams::replay())
    }

    fn epoch(&mut self, epoch: usize, nb_steps: usize) -> Result<()> {
        self.acquire()?;
        let losses = a2c_losses(&self.workspace, self.config.discount_factor)?;
        let loss = losses.total(&self.config)?;
        ensure_finite(&loss, StreamKey::custom("loss"))?;
        self.logger.add_scalar(
            "critic_loss",
            losses.critic_loss.to_scalar::<f32>()? as f64,
            nb_steps,
        );
        self.logger.add_scalar(
            "entropy_loss",
            losses.entropy_loss.to_scalar::<f32>()? as f64,
            nb_steps,
        );
        self.logger.add_scalar(
            "a2c_loss",
            losses.a2c_loss.to_scalar::<f32>()? as f64,
            nb_steps,
        );
        let mut grads = loss.backward()?;
        let grad_norm = clip_grad_norm(&mut grads, &self.vars, self.config.max_grad_norm)?;
        self.optimizer.step(&grads)?;
        tracing::debug!(epoch, nb_steps, grad_norm, "a2c update");
        Ok(())
    }

    /// Deterministic rollout until every evaluation env is done, returns the mean final return.
    pub fn evaluate(&mut self) -> Result<f64> {
        let snapshot = self.train_agent.agent().state_dict()?;
        self.eval_agent.agent_mut().load_state_dict(&snapshot)?;
        let mut workspace = Workspace::new();
        self.eval_agent.execute(
            &mut workspace,
            0,
            &StopCondition::UntilAll(StreamKey::Done),
            ExecutionParams::evaluation(),
        )?;
        let last = workspace.time_size() - 1;
        let rewards = workspace.get(&StreamKey::CumulatedReward, last)?;
        Ok(rewards.mean_all()?.to_scalar::<f32>()? as f64)
    }
}
