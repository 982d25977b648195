use crate::error::Result;
use crate::snapshot::PolicySnapshot;
use crate::workspace::{StreamKey, Workspace};
use candle_core::{DType, Var};
use candle_nn::VarMap;
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Sample actions from the policy distribution.
    #[default]
    Stochastic,
    /// Take the mode of the distribution.
    Deterministic,
}

/// Per call options forwarded to every agent of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExecutionParams {
    pub mode: ExecutionMode,
    /// Recompute outputs for actions that are already in the workspace instead of acting.
    pub replay: bool,
    /// Fixed standard deviation for continuous policies, overrides the learned one.
    pub action_std: Option<f32>,
}

impl ExecutionParams {
    pub fn acquisition() -> Self {
        Self::default()
    }

    pub fn evaluation() -> Self {
        Self {
            mode: ExecutionMode::Deterministic,
            ..Self::default()
        }
    }

    pub fn replay() -> Self {
        Self {
            replay: true,
            ..Self::default()
        }
    }

    pub fn with_action_std(mut self, action_std: Option<f32>) -> Self {
        self.action_std = action_std;
        self
    }

    pub fn deterministic(&self) -> bool {
        self.mode == ExecutionMode::Deterministic
    }
}

pub struct StepContext<'a> {
    pub params: ExecutionParams,
    pub rng: &'a mut StdRng,
}

/// A stage that reads and writes the workspace at a single time index.
pub trait Agent: Send {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()>;
}

impl<A: Agent + ?Sized> Agent for Box<A> {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        (**self).forward(workspace, t, ctx)
    }
}

impl<A: Agent + ?Sized> Agent for &mut A {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        (**self).forward(workspace, t, ctx)
    }
}

/// Runs `first` then `second` at every time index.
#[derive(Debug, Clone)]
pub struct Chain<A, B> {
    pub first: A,
    pub second: B,
}

impl<A, B> Chain<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: Agent, B: Agent> Agent for Chain<A, B> {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        self.first.forward(workspace, t, ctx)?;
        self.second.forward(workspace, t, ctx)
    }
}

/// Owns a parameter set that can be snapshotted and restored.
pub trait Parameterized {
    fn varmap(&self) -> &VarMap;

    fn parameters(&self) -> Vec<Var> {
        self.varmap().all_vars()
    }

    fn state_dict(&self) -> Result<PolicySnapshot> {
        PolicySnapshot::from_varmap(self.varmap())
    }

    fn load_state_dict(&mut self, snapshot: &PolicySnapshot) -> Result<()> {
        snapshot.load_into(self.varmap())
    }
}

impl<P: Parameterized + ?Sized> Parameterized for Box<P> {
    fn varmap(&self) -> &VarMap {
        (**self).varmap()
    }
}

pub trait PolicyAgent: Agent + Parameterized {}

impl<T: Agent + Parameterized + ?Sized> PolicyAgent for T {}

#[derive(Debug, Clone, PartialEq)]
pub enum StopCondition {
    /// Advance exactly this many time indices.
    Steps(usize),
    /// Advance until the given boolean stream is set for every environment.
    UntilAll(StreamKey),
}

fn all_set(workspace: &Workspace, key: &StreamKey, t: usize) -> Result<bool> {
    let min = workspace
        .get(key, t)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .min(0)?
        .to_scalar::<f32>()?;
    Ok(min > 0.)
}

/// Advances `workspace` from time index `t` and returns the number of steps executed.
pub fn execute<A: Agent + ?Sized>(
    agent: &mut A,
    workspace: &mut Workspace,
    t: usize,
    stop: &StopCondition,
    ctx: &mut StepContext<'_>,
) -> Result<usize> {
    match stop {
        StopCondition::Steps(n_steps) => {
            for step in t..t + n_steps {
                agent.forward(workspace, step, ctx)?;
            }
            Ok(*n_steps)
        }
        StopCondition::UntilAll(key) => {
            let mut step = t;
            loop {
                agent.forward(workspace, step, ctx)?;
                step += 1;
                if all_set(workspace, key, step - 1)? {
                    return Ok(step - t);
                }
            }
        }
    }
}

/// Re-runs `agent` over every stored time index with `replay` set.
pub fn replay<A: Agent + ?Sized>(
    agent: &mut A,
    workspace: &mut Workspace,
    ctx: &mut StepContext<'_>,
) -> Result<()> {
    let params = ctx.params;
    ctx.params.replay = true;
    let result = (0..workspace.time_size()).try_for_each(|t| agent.forward(workspace, t, ctx));
    ctx.params = params;
    result
}

/// An agent together with the random generator that drives it.
pub struct TemporalAgent<A> {
    agent: A,
    rng: StdRng,
}

impl<A: Agent> TemporalAgent<A> {
    pub fn new(agent: A, seed: u64) -> Self {
        Self {
            agent,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut A {
        &mut self.agent
    }

    pub fn into_inner(self) -> A {
        self.agent
    }

    pub fn execute(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        stop: &StopCondition,
        params: ExecutionParams,
    ) -> Result<usize> {
        let mut ctx = StepContext {
            params,
            rng: &mut self.rng,
        };
        execute(&mut self.agent, workspace, t, stop, &mut ctx)
    }

    pub fn replay(&mut self, workspace: &mut Workspace, params: ExecutionParams) -> Result<()> {
        let mut ctx = StepContext {
            params,
            rng: &mut self.rng,
        };
        replay(&mut self.agent, workspace, &mut ctx)
    }
}

/// Environment stepper followed by a policy: the unit the acquisition side executes.
pub struct AcquisitionUnit {
    pub env: Box<dyn Agent>,
    pub policy: Box<dyn PolicyAgent>,
}

impl AcquisitionUnit {
    pub fn new(env: impl Agent + 'static, policy: impl PolicyAgent + 'static) -> Self {
        Self {
            env: Box::new(env),
            policy: Box::new(policy),
        }
    }
}

impl Agent for AcquisitionUnit {
    fn forward(
        &mut self,
        workspace: &mut Workspace,
        t: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<()> {
        self.env.forward(workspace, t, ctx)?;
        self.policy.forward(workspace, t, ctx)
    }
}

impl Parameterized for AcquisitionUnit {
    fn varmap(&self) -> &VarMap {
        self.policy.varmap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvAgent;
    use crate::test_utils::{ConstantPolicy, CountingAgent, ScriptedEnv};
    use anyhow::Result;

    #[test]
    fn steps_condition_runs_a_fixed_number_of_indices() -> Result<()> {
        let mut agent = TemporalAgent::new(CountingAgent::new(StreamKey::custom("count")), 0);
        let mut ws = Workspace::new();
        let executed = agent.execute(
            &mut ws,
            0,
            &StopCondition::Steps(4),
            ExecutionParams::acquisition(),
        )?;
        assert_eq!(executed, 4);
        assert_eq!(ws.time_size(), 4);
        assert_eq!(agent.agent().calls(), vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn until_all_stops_once_every_env_is_done() -> Result<()> {
        let envs = vec![
            ScriptedEnv::new(vec![1.; 10], 2),
            ScriptedEnv::new(vec![1.; 10], 5),
        ];
        let env_agent = EnvAgent::no_auto_reset(envs)?;
        let mut agent = TemporalAgent::new(Chain::new(env_agent, ConstantPolicy::discrete(0)), 0);
        let mut ws = Workspace::new();
        let executed = agent.execute(
            &mut ws,
            0,
            &StopCondition::UntilAll(StreamKey::Done),
            ExecutionParams::evaluation(),
        )?;
        // reset at t = 0 then five steps for the slower env
        assert_eq!(executed, 6);
        let done: Vec<Vec<u8>> = ws.get_full(&StreamKey::Done)?.to_vec2()?;
        assert_eq!(done[5], vec![1, 1]);
        assert_eq!(done[4], vec![1, 0]);
        Ok(())
    }

    #[test]
    fn replay_sets_the_flag_and_restores_params() -> Result<()> {
        let mut agent = TemporalAgent::new(CountingAgent::new(StreamKey::custom("count")), 0);
        let mut ws = Workspace::new();
        agent.execute(
            &mut ws,
            0,
            &StopCondition::Steps(3),
            ExecutionParams::acquisition(),
        )?;
        agent.replay(&mut ws, ExecutionParams::acquisition())?;
        assert_eq!(agent.agent().calls(), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(agent.agent().replays(), 3);
        Ok(())
    }
}
