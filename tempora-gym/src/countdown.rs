use tempora_core::Result;
use tempora_core::env::{Action, Env, EnvironmentDescription, SnapShot, Space};

/// Counts down from `length` and pays 1 for every step where action 1 is taken.
///
/// Deterministic and seed independent. The terminal step reports success when every action of
/// the episode was 1.
#[derive(Debug, Clone)]
pub struct CountDown {
    length: usize,
    remaining: usize,
    perfect: bool,
}

impl CountDown {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            remaining: length,
            perfect: true,
        }
    }

    fn observation(&self) -> Vec<f32> {
        vec![self.remaining as f32 / self.length.max(1) as f32]
    }
}

impl Env for CountDown {
    fn reset(&mut self, _seed: u64) -> Result<Vec<f32>> {
        self.remaining = self.length;
        self.perfect = true;
        Ok(self.observation())
    }

    fn step(&mut self, action: Action<'_>) -> Result<SnapShot> {
        let hit = matches!(action, Action::Discrete(1));
        self.perfect &= hit;
        self.remaining = self.remaining.saturating_sub(1);
        let terminated = self.remaining == 0;
        Ok(SnapShot {
            state: self.observation(),
            reward: if hit { 1. } else { 0. },
            terminated,
            truncated: false,
            success: terminated.then_some(self.perfect),
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(Space::continuous_from_dims(&[1]), Space::Discrete(2))
    }
}
