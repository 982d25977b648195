use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempora_core::env::{Action, Env, EnvironmentDescription, SnapShot, Space};
use tempora_core::{Result, TemporaError};

const GRAVITY: f32 = 9.8;
const CART_MASS: f32 = 1.0;
const POLE_MASS: f32 = 0.1;
const POLE_LENGTH: f32 = 0.5;
const FORCE_MAG: f32 = 10.0;
const DT: f32 = 0.02;
const X_THRESHOLD: f32 = 2.4;
const THETA_THRESHOLD: f32 = 12.0 * std::f32::consts::PI / 180.0;
const INIT_RANGE: f32 = 0.05;

/// Classic cart-pole balancing task with two discrete actions (push left, push right).
///
/// Pays 1 per step, terminates when the pole falls or the cart leaves the track and is
/// truncated after `max_episode_steps`.
#[derive(Debug, Clone)]
pub struct CartPole {
    state: [f32; 4],
    steps: usize,
    max_episode_steps: usize,
}

impl CartPole {
    pub fn new(max_episode_steps: usize) -> Self {
        Self {
            state: [0.; 4],
            steps: 0,
            max_episode_steps,
        }
    }

    pub fn state(&self) -> [f32; 4] {
        self.state
    }
}

impl Default for CartPole {
    fn default() -> Self {
        Self::new(500)
    }
}

impl Env for CartPole {
    fn reset(&mut self, seed: u64) -> Result<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        for value in self.state.iter_mut() {
            *value = rng.random_range(-INIT_RANGE..INIT_RANGE);
        }
        self.steps = 0;
        Ok(self.state.to_vec())
    }

    fn step(&mut self, action: Action<'_>) -> Result<SnapShot> {
        let force = match action {
            Action::Discrete(1) => FORCE_MAG,
            Action::Discrete(0) => -FORCE_MAG,
            other => {
                return Err(TemporaError::config(format!(
                    "cart-pole only accepts actions 0 and 1, got {other:?}"
                )));
            }
        };
        let [x, x_dot, theta, theta_dot] = self.state;
        let (sin_theta, cos_theta) = theta.sin_cos();
        let total_mass = CART_MASS + POLE_MASS;
        let pole_mass_length = POLE_MASS * POLE_LENGTH;

        let temp = (force + pole_mass_length * theta_dot * theta_dot * sin_theta) / total_mass;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (POLE_LENGTH * (4.0 / 3.0 - POLE_MASS * cos_theta * cos_theta / total_mass));
        let x_acc = temp - pole_mass_length * theta_acc * cos_theta / total_mass;

        self.state = [
            x + DT * x_dot,
            x_dot + DT * x_acc,
            theta + DT * theta_dot,
            theta_dot + DT * theta_acc,
        ];
        self.steps += 1;
        let [x, _, theta, _] = self.state;
        let terminated = x.abs() > X_THRESHOLD || theta.abs() > THETA_THRESHOLD;
        Ok(SnapShot {
            state: self.state.to_vec(),
            reward: 1.,
            terminated,
            truncated: !terminated && self.steps >= self.max_episode_steps,
            success: None,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(Space::continuous_from_dims(&[4]), Space::Discrete(2))
    }
}
