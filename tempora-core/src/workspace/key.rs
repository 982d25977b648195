use candle_core::DType;
use std::fmt::Display;

/// What a stream is used for. Agents only ever read streams by role-specific keys, so the
/// set of roles doubles as the workspace schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Observation,
    Action,
    Reward,
    Done,
    Value,
    LogProb,
    Auxiliary,
}

/// Key of a named tensor stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKey {
    Observation,
    Reward,
    Done,
    CumulatedReward,
    Timestep,
    Success,
    Action,
    ActionProbs,
    ActionLogprobs,
    OldActionLogprobs,
    Entropy,
    Critic,
    Custom(String),
}

impl StreamKey {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Observation => "env/env_obs",
            Self::Reward => "env/reward",
            Self::Done => "env/done",
            Self::CumulatedReward => "env/cumulated_reward",
            Self::Timestep => "env/timestep",
            Self::Success => "env/success",
            Self::Action => "action",
            Self::ActionProbs => "action_probs",
            Self::ActionLogprobs => "action_logprobs",
            Self::OldActionLogprobs => "old_action_logprobs",
            Self::Entropy => "entropy",
            Self::Critic => "critic",
            Self::Custom(name) => name,
        }
    }

    pub fn role(&self) -> StreamRole {
        match self {
            Self::Observation => StreamRole::Observation,
            Self::Action => StreamRole::Action,
            Self::Reward | Self::CumulatedReward => StreamRole::Reward,
            Self::Done => StreamRole::Done,
            Self::Critic => StreamRole::Value,
            Self::ActionLogprobs | Self::OldActionLogprobs => StreamRole::LogProb,
            Self::Timestep
            | Self::Success
            | Self::ActionProbs
            | Self::Entropy
            | Self::Custom(_) => StreamRole::Auxiliary,
        }
    }

    /// The dtype every write to this stream must carry. `None` means any dtype is accepted,
    /// actions are `u32` for discrete spaces and `f32` for continuous ones.
    pub fn expected_dtype(&self) -> Option<DType> {
        match self {
            Self::Done => Some(DType::U8),
            Self::Timestep => Some(DType::U32),
            Self::Observation
            | Self::Reward
            | Self::CumulatedReward
            | Self::Success
            | Self::ActionProbs
            | Self::ActionLogprobs
            | Self::OldActionLogprobs
            | Self::Entropy
            | Self::Critic => Some(DType::F32),
            Self::Action | Self::Custom(_) => None,
        }
    }
}

impl Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
