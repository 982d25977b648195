use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;
use tempora_core::env::{Action, Env, EnvironmentDescription, SnapShot, Space};
use tempora_core::{Result, TemporaError};

const MAX_SPEED: f32 = 8.;
const MAX_TORQUE: f32 = 2.;
const DT: f32 = 0.05;
const GRAVITY: f32 = 10.;
const MASS: f32 = 1.;
const LENGTH: f32 = 1.;

fn angle_normalize(theta: f32) -> f32 {
    (theta + PI).rem_euclid(2. * PI) - PI
}

/// Inverted pendulum swing-up with a single continuous torque in `[-2, 2]`.
///
/// Observations are `[cos(theta), sin(theta), theta_dot]`. There is no terminal state, episodes
/// are truncated after `max_episode_steps`.
#[derive(Debug, Clone)]
pub struct Pendulum {
    theta: f32,
    theta_dot: f32,
    steps: usize,
    max_episode_steps: usize,
}

impl Pendulum {
    pub fn new(max_episode_steps: usize) -> Self {
        Self {
            theta: 0.,
            theta_dot: 0.,
            steps: 0,
            max_episode_steps,
        }
    }

    fn observation(&self) -> Vec<f32> {
        vec![self.theta.cos(), self.theta.sin(), self.theta_dot]
    }
}

impl Default for Pendulum {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Env for Pendulum {
    fn reset(&mut self, seed: u64) -> Result<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.theta = rng.random_range(-PI..PI);
        self.theta_dot = rng.random_range(-1f32..1.);
        self.steps = 0;
        Ok(self.observation())
    }

    fn step(&mut self, action: Action<'_>) -> Result<SnapShot> {
        let torque = match action {
            Action::Continuous([torque]) => torque.clamp(-MAX_TORQUE, MAX_TORQUE),
            other => {
                return Err(TemporaError::config(format!(
                    "pendulum expects a single torque, got {other:?}"
                )));
            }
        };
        let cost = angle_normalize(self.theta).powi(2)
            + 0.1 * self.theta_dot.powi(2)
            + 0.001 * torque.powi(2);
        self.theta_dot = (self.theta_dot
            + (3. * GRAVITY / (2. * LENGTH) * self.theta.sin()
                + 3. / (MASS * LENGTH * LENGTH) * torque)
                * DT)
            .clamp(-MAX_SPEED, MAX_SPEED);
        self.theta += self.theta_dot * DT;
        self.steps += 1;
        Ok(SnapShot {
            state: self.observation(),
            reward: -cost,
            terminated: false,
            truncated: self.steps >= self.max_episode_steps,
            success: None,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(
            Space::continuous_from_dims(&[3]),
            Space::Continuous {
                min: Some(vec![-MAX_TORQUE]),
                max: Some(vec![MAX_TORQUE]),
                size: 1,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angles_wrap_around() {
        assert!((angle_normalize(3. * PI / 2.) + PI / 2.).abs() < 1e-5);
        assert!((angle_normalize(0.25) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn rewards_are_costs_and_episodes_truncate() -> anyhow::Result<()> {
        let mut env = Pendulum::new(2);
        let obs = env.reset(3)?;
        assert!((obs[0].powi(2) + obs[1].powi(2) - 1.).abs() < 1e-5);
        let first = env.step(Action::Continuous(&[5.]))?;
        assert!(first.reward <= 0.);
        assert!(!first.done());
        let second = env.step(Action::Continuous(&[-1.]))?;
        assert!(second.truncated && !second.terminated);
        assert!(env.step(Action::Discrete(0)).is_err());
        Ok(())
    }
}
