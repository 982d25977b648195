mod env_agent;

pub use env_agent::{EnvAgent, ResetMode};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum Space {
    Discrete(usize),
    Continuous {
        min: Option<Vec<f32>>,
        max: Option<Vec<f32>>,
        size: usize,
    },
}

impl Space {
    pub fn continuous_from_dims(dims: &[usize]) -> Self {
        Self::Continuous {
            min: None,
            max: None,
            size: dims.iter().product(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::Discrete(size) => *size,
            Self::Continuous { size, .. } => *size,
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, Self::Discrete(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentDescription {
    pub observation_space: Space,
    pub action_space: Space,
}

impl EnvironmentDescription {
    pub fn new(observation_space: Space, action_space: Space) -> Self {
        Self {
            observation_space,
            action_space,
        }
    }

    pub fn action_size(&self) -> usize {
        self.action_space.size()
    }

    pub fn observation_size(&self) -> usize {
        self.observation_space.size()
    }
}

/// Outcome of a single environment step.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapShot {
    pub state: Vec<f32>,
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
    /// Only set by environments that know what success means.
    pub success: Option<bool>,
}

impl SnapShot {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action<'a> {
    Discrete(usize),
    Continuous(&'a [f32]),
}

/// A single simulator instance.
pub trait Env: Send {
    fn reset(&mut self, seed: u64) -> Result<Vec<f32>>;

    fn step(&mut self, action: Action<'_>) -> Result<SnapShot>;

    fn env_description(&self) -> EnvironmentDescription;
}

impl<E: Env + ?Sized> Env for Box<E> {
    fn reset(&mut self, seed: u64) -> Result<Vec<f32>> {
        (**self).reset(seed)
    }

    fn step(&mut self, action: Action<'_>) -> Result<SnapShot> {
        (**self).step(action)
    }

    fn env_description(&self) -> EnvironmentDescription {
        (**self).env_description()
    }
}

pub trait EnvBuilder: Sync + Send + 'static {
    type Env: Env;

    fn build_env(&self) -> Result<Self::Env>;
}

impl<E: Env, F: Sync + Send + 'static> EnvBuilder for F
where
    F: Fn() -> Result<E>,
{
    type Env = E;

    fn build_env(&self) -> Result<Self::Env> {
        (self)()
    }
}
