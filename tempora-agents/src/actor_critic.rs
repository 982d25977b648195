use crate::critic::CriticAgent;
use candle_core::Var;
use tempora_core::agent::{Agent, Parameterized, PolicyAgent, StepContext};
use tempora_core::{Result, Workspace};

/// The training side network: the policy followed by the critic on the learning device.
pub struct ActorCritic {
    pub policy: Box<dyn PolicyAgent>,
    pub critic: CriticAgent,
}

impl ActorCritic {
    pub fn new(policy: impl PolicyAgent + 'static, critic: CriticAgent) -> Self {
        Self {
            policy: Box::new(policy),
            critic,
        }
    }

    pub fn policy_parameters(&self) -> Vec<Var> {
        self.policy.parameters()
    }

    pub fn critic_parameters(&self) -> Vec<Var> {
        self.critic.parameters()
    }

    /// Parameters of both networks, policy first.
    pub fn parameters(&self) -> Vec<Var> {
        let mut vars = self.policy_parameters();
        vars.extend(self.critic_parameters());
        vars
    }
}

impl Agent for ActorCritic {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        self.policy.forward(workspace, t, ctx)?;
        self.critic.forward(workspace, t, ctx)
    }
}
