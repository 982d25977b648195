pub mod a2c;
pub mod actor_critic;
pub mod config;
pub mod critic;
pub mod losses;
pub mod network;
pub mod policies;
pub mod ppo;
pub mod stop;

pub use a2c::A2C;
pub use actor_critic::ActorCritic;
pub use config::{A2CConfig, DeviceConfig, PPOConfig};
pub use critic::CriticAgent;
pub use policies::{CategoricalPolicy, GaussianPolicy, PolicyKind};
pub use ppo::PPO;
pub use stop::{StopCriterion, TrainingReport};
