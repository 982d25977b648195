use serde::Deserialize;
use std::time::Duration;
use tempora_core::TemporaError;

/// Which budget ends training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum StopCriterion {
    #[default]
    Epochs,
    Steps,
    /// Wall clock, measured in calibrated time units.
    Time,
}

impl TryFrom<String> for StopCriterion {
    type Error = TemporaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

impl TryFrom<&str> for StopCriterion {
    type Error = TemporaError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "epochs" => Ok(Self::Epochs),
            "steps" => Ok(Self::Steps),
            "time" => Ok(Self::Time),
            other => Err(TemporaError::config(format!(
                "unknown stop criterion `{other}`, expected one of epochs, steps, time"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningSchedule {
    EpochBound { max_epochs: usize },
    StepBound { max_steps: usize },
    /// `time_unit` is the calibrated unit in seconds.
    TimeBound { time_limit: f64, time_unit: f64 },
}

impl LearningSchedule {
    pub fn keep_going(&self, epoch: usize, n_interactions: usize, elapsed: Duration) -> bool {
        match *self {
            Self::EpochBound { max_epochs } => epoch < max_epochs,
            Self::StepBound { max_steps } => n_interactions < max_steps,
            Self::TimeBound {
                time_limit,
                time_unit,
            } => elapsed.as_secs_f64() < time_limit * time_unit,
        }
    }
}

/// What a finished training run reports back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingReport {
    pub n_epochs: usize,
    pub training_time: Duration,
    pub n_interactions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criteria_parse_from_their_names() {
        assert_eq!(StopCriterion::try_from("steps").ok(), Some(StopCriterion::Steps));
        assert_eq!(StopCriterion::try_from("time").ok(), Some(StopCriterion::Time));
        assert!(matches!(
            StopCriterion::try_from("forever"),
            Err(TemporaError::Configuration(_))
        ));
    }

    #[test]
    fn schedules_compare_against_their_own_budget() {
        let epochs = LearningSchedule::EpochBound { max_epochs: 3 };
        assert!(epochs.keep_going(2, 10_000, Duration::from_secs(100)));
        assert!(!epochs.keep_going(3, 0, Duration::ZERO));
        let steps = LearningSchedule::StepBound { max_steps: 1000 };
        assert!(steps.keep_going(50, 999, Duration::ZERO));
        assert!(!steps.keep_going(0, 1000, Duration::ZERO));
        let time = LearningSchedule::TimeBound {
            time_limit: 10.,
            time_unit: 0.5,
        };
        assert!(time.keep_going(0, 0, Duration::from_secs(4)));
        assert!(!time.keep_going(0, 0, Duration::from_secs(5)));
    }
}
