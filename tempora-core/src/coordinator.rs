use crate::agent::{AcquisitionUnit, ExecutionParams, Parameterized, StopCondition, TemporalAgent};
use crate::error::{Result, TemporaError};
use crate::snapshot::PolicySnapshot;
use crate::workspace::Workspace;
use candle_core::Device;
use crossbeam::channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Builds the acquisition unit owning `n_envs` environments on `device`.
pub trait UnitBuilder: Send + Sync + 'static {
    fn build_unit(&self, n_envs: usize, device: &Device) -> Result<AcquisitionUnit>;
}

impl<F: Send + Sync + 'static> UnitBuilder for F
where
    F: Fn(usize, &Device) -> Result<AcquisitionUnit>,
{
    fn build_unit(&self, n_envs: usize, device: &Device) -> Result<AcquisitionUnit> {
        (self)(n_envs, device)
    }
}

// Replaces the workspace by its last `t` steps (or an empty one) and advances it.
fn advance(
    agent: &mut TemporalAgent<AcquisitionUnit>,
    workspace: &mut Workspace,
    t: usize,
    stop: &StopCondition,
    params: ExecutionParams,
) -> Result<()> {
    *workspace = if t == 0 {
        Workspace::new()
    } else {
        workspace.detach().copy_n_last_steps(t)?
    };
    agent.execute(workspace, t, stop, params)?;
    Ok(())
}

pub enum WorkerCommand {
    Seed(u64),
    LoadPolicy(Arc<Vec<u8>>),
    Rollout {
        t: usize,
        stop: StopCondition,
        params: ExecutionParams,
    },
    Close,
}

pub enum WorkerResult {
    Seeded,
    PolicyLoaded,
    Shard(Workspace),
    Failed(String),
}

struct AcquisitionWorker {
    tx: Sender<WorkerResult>,
    rx: Receiver<WorkerCommand>,
    agent: TemporalAgent<AcquisitionUnit>,
    workspace: Workspace,
}

impl AcquisitionWorker {
    fn load_policy(&mut self, bytes: &[u8]) -> Result<WorkerResult> {
        let snapshot = PolicySnapshot::decode(bytes)?;
        self.agent.agent_mut().load_state_dict(&snapshot)?;
        Ok(WorkerResult::PolicyLoaded)
    }

    fn rollout(
        &mut self,
        t: usize,
        stop: &StopCondition,
        params: ExecutionParams,
    ) -> Result<WorkerResult> {
        advance(&mut self.agent, &mut self.workspace, t, stop, params)?;
        Ok(WorkerResult::Shard(self.workspace.detach()))
    }

    fn work(mut self) {
        while let Ok(command) = self.rx.recv() {
            let result = match command {
                WorkerCommand::Close => break,
                WorkerCommand::Seed(seed) => {
                    self.agent.seed(seed);
                    Ok(WorkerResult::Seeded)
                }
                WorkerCommand::LoadPolicy(bytes) => self.load_policy(&bytes),
                WorkerCommand::Rollout { t, stop, params } => self.rollout(t, &stop, params),
            };
            let result = result.unwrap_or_else(|err| WorkerResult::Failed(err.to_string()));
            if self.tx.send(result).is_err() {
                break;
            }
        }
    }
}

struct WorkerHandle {
    tx: Sender<WorkerCommand>,
    rx: Receiver<WorkerResult>,
    thread: Option<JoinHandle<()>>,
}

/// Acquisition fanned out over worker threads, each owning an equal share of the environments
/// and a private workspace shard.
pub struct RemoteAcquisition {
    workers: Vec<WorkerHandle>,
}

impl RemoteAcquisition {
    pub fn spawn<B: UnitBuilder>(
        builder: &B,
        n_envs: usize,
        n_workers: usize,
        device: &Device,
    ) -> Result<Self> {
        if n_workers == 0 || n_envs % n_workers != 0 {
            return Err(TemporaError::config(format!(
                "{n_envs} environments cannot be split evenly over {n_workers} workers"
            )));
        }
        let envs_per_worker = n_envs / n_workers;
        let mut workers = Vec::with_capacity(n_workers);
        for worker_idx in 0..n_workers {
            let unit = builder.build_unit(envs_per_worker, device)?;
            let (command_tx, command_rx) = crossbeam::channel::unbounded::<WorkerCommand>();
            let (result_tx, result_rx) = crossbeam::channel::unbounded::<WorkerResult>();
            let worker = AcquisitionWorker {
                tx: result_tx,
                rx: command_rx,
                agent: TemporalAgent::new(unit, worker_idx as u64),
                workspace: Workspace::new(),
            };
            let thread = std::thread::Builder::new()
                .name(format!("tempora-worker-{worker_idx}"))
                .spawn(move || worker.work())?;
            workers.push(WorkerHandle {
                tx: command_tx,
                rx: result_rx,
                thread: Some(thread),
            });
        }
        tracing::info!(n_workers, envs_per_worker, "acquisition workers spawned");
        Ok(Self { workers })
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    // Sends one command per worker, then waits for every reply.
    fn round(&self, commands: Vec<WorkerCommand>) -> Result<Vec<WorkerResult>> {
        for (worker_idx, (worker, command)) in self.workers.iter().zip(commands).enumerate() {
            worker
                .tx
                .send(command)
                .map_err(|_| TemporaError::WorkerFailed {
                    worker: worker_idx,
                    reason: "command channel closed".to_owned(),
                })?;
        }
        let replies = self
            .workers
            .iter()
            .map(|worker| worker.rx.recv())
            .collect::<Vec<_>>();
        replies
            .into_iter()
            .enumerate()
            .map(|(worker_idx, reply)| match reply {
                Ok(WorkerResult::Failed(reason)) => Err(TemporaError::WorkerFailed {
                    worker: worker_idx,
                    reason,
                }),
                Ok(result) => Ok(result),
                Err(_) => Err(TemporaError::WorkerFailed {
                    worker: worker_idx,
                    reason: "worker exited".to_owned(),
                }),
            })
            .collect()
    }

    /// Worker `i` is seeded with `seed + i`.
    pub fn seed(&mut self, seed: u64) -> Result<()> {
        let commands = (0..self.workers.len())
            .map(|worker_idx| WorkerCommand::Seed(seed + worker_idx as u64))
            .collect();
        self.round(commands)?;
        Ok(())
    }

    pub fn load_policy(&mut self, snapshot: &PolicySnapshot) -> Result<()> {
        let bytes = Arc::new(snapshot.encode()?);
        let commands = self
            .workers
            .iter()
            .map(|_| WorkerCommand::LoadPolicy(bytes.clone()))
            .collect();
        self.round(commands)?;
        Ok(())
    }

    /// Runs one round on every worker and merges the shards along the batch axis. Shards that
    /// stopped early under [`StopCondition::UntilAll`] are padded with their final step.
    pub fn rollout(
        &mut self,
        t: usize,
        stop: &StopCondition,
        params: ExecutionParams,
    ) -> Result<Workspace> {
        let commands = self
            .workers
            .iter()
            .map(|_| WorkerCommand::Rollout {
                t,
                stop: stop.clone(),
                params,
            })
            .collect();
        let shards = self
            .round(commands)?
            .into_iter()
            .enumerate()
            .map(|(worker_idx, result)| match result {
                WorkerResult::Shard(shard) => Ok(shard),
                _ => Err(TemporaError::WorkerFailed {
                    worker: worker_idx,
                    reason: "unexpected reply to a rollout".to_owned(),
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        let time_size = shards
            .iter()
            .map(Workspace::time_size)
            .max()
            .unwrap_or_default();
        let shards = shards
            .iter()
            .map(|shard| {
                if shard.time_size() < time_size {
                    shard.pad_time(time_size)
                } else {
                    Ok(shard.clone())
                }
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(time_size, n_shards = shards.len(), "rollout shards merged");
        Workspace::concat_batch(&shards)
    }

    /// Stops every worker and waits for its thread. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        let mut failure = None;
        for (worker_idx, worker) in self.workers.iter_mut().enumerate() {
            let _ = worker.tx.send(WorkerCommand::Close);
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() && failure.is_none() {
                    failure = Some(TemporaError::WorkerFailed {
                        worker: worker_idx,
                        reason: "worker panicked".to_owned(),
                    });
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for RemoteAcquisition {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(%err, "failed to close acquisition workers");
        }
    }
}

/// Rollout collection, either in the calling thread or fanned out over workers.
pub enum Acquisition {
    InProcess {
        agent: Box<TemporalAgent<AcquisitionUnit>>,
        workspace: Workspace,
    },
    Remote(RemoteAcquisition),
}

impl Acquisition {
    /// A single worker runs in process, more workers get their own threads.
    pub fn build<B: UnitBuilder>(
        builder: &B,
        n_envs: usize,
        n_workers: usize,
        device: &Device,
    ) -> Result<Self> {
        match n_workers {
            0 => Err(TemporaError::config("at least one acquisition worker is needed")),
            1 => Ok(Self::in_process(builder.build_unit(n_envs, device)?)),
            _ => Ok(Self::Remote(RemoteAcquisition::spawn(
                builder, n_envs, n_workers, device,
            )?)),
        }
    }

    pub fn in_process(unit: AcquisitionUnit) -> Self {
        Self::InProcess {
            agent: Box::new(TemporalAgent::new(unit, 0)),
            workspace: Workspace::new(),
        }
    }

    pub fn n_workers(&self) -> usize {
        match self {
            Self::InProcess { .. } => 1,
            Self::Remote(remote) => remote.n_workers(),
        }
    }

    pub fn seed(&mut self, seed: u64) -> Result<()> {
        match self {
            Self::InProcess { agent, .. } => {
                agent.seed(seed);
                Ok(())
            }
            Self::Remote(remote) => remote.seed(seed),
        }
    }

    pub fn load_policy(&mut self, snapshot: &PolicySnapshot) -> Result<()> {
        match self {
            Self::InProcess { agent, .. } => agent.agent_mut().load_state_dict(snapshot),
            Self::Remote(remote) => remote.load_policy(snapshot),
        }
    }

    /// Collects one rollout. With `t > 0` the last `t` steps of the previous rollout are kept
    /// and execution resumes at index `t`.
    pub fn rollout(
        &mut self,
        t: usize,
        stop: &StopCondition,
        params: ExecutionParams,
    ) -> Result<Workspace> {
        match self {
            Self::InProcess { agent, workspace } => {
                advance(agent, workspace, t, stop, params)?;
                Ok(workspace.clone())
            }
            Self::Remote(remote) => remote.rollout(t, stop, params),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Self::InProcess { .. } => Ok(()),
            Self::Remote(remote) => remote.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Action, Env, EnvAgent, EnvironmentDescription, SnapShot, Space};
    use crate::test_utils::{ConstantPolicy, ScriptedEnv};
    use crate::workspace::StreamKey;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scripted_unit(n_envs: usize, _device: &Device) -> crate::Result<AcquisitionUnit> {
        let envs = (0..n_envs)
            .map(|_| ScriptedEnv::new(vec![1.; 10], 4))
            .collect();
        Ok(AcquisitionUnit::new(
            EnvAgent::auto_reset(envs)?,
            ConstantPolicy::parameterized(0)?,
        ))
    }

    fn last_actions(ws: &Workspace, t: usize) -> Result<Vec<f32>> {
        let obs: Vec<Vec<f32>> = ws.get(&StreamKey::Observation, t)?.to_vec2()?;
        Ok(obs.into_iter().map(|row| row[1]).collect())
    }

    #[test]
    fn remote_rollout_merges_shards_with_synced_weights() -> Result<()> {
        let mut acquisition = Acquisition::build(&scripted_unit, 4, 2, &Device::Cpu)?;
        assert_eq!(acquisition.n_workers(), 2);
        acquisition.seed(3)?;
        let trainer = ConstantPolicy::parameterized(1)?;
        acquisition.load_policy(&trainer.state_dict()?)?;
        let ws = acquisition.rollout(
            0,
            &StopCondition::Steps(3),
            ExecutionParams::acquisition(),
        )?;
        assert_eq!(ws.time_size(), 3);
        assert_eq!(ws.batch_size(), 4);
        assert_eq!(last_actions(&ws, 2)?, vec![1.; 4]);

        let next = acquisition.rollout(
            1,
            &StopCondition::Steps(2),
            ExecutionParams::acquisition(),
        )?;
        assert_eq!(next.time_size(), 3);
        let carried: Vec<Vec<f32>> = next.get(&StreamKey::Observation, 0)?.to_vec2()?;
        let previous: Vec<Vec<f32>> = ws.get(&StreamKey::Observation, 2)?.to_vec2()?;
        assert_eq!(carried, previous);
        acquisition.close()?;
        Ok(())
    }

    #[test]
    fn remote_and_in_process_agree() -> Result<()> {
        let mut remote = Acquisition::build(&scripted_unit, 2, 2, &Device::Cpu)?;
        let mut local = Acquisition::build(&scripted_unit, 2, 1, &Device::Cpu)?;
        let stop = StopCondition::Steps(6);
        let remote_ws = remote.rollout(0, &stop, ExecutionParams::acquisition())?;
        let local_ws = local.rollout(0, &stop, ExecutionParams::acquisition())?;
        for key in [StreamKey::Reward, StreamKey::CumulatedReward] {
            let lhs: Vec<Vec<f32>> = remote_ws.get_full(&key)?.to_vec2()?;
            let rhs: Vec<Vec<f32>> = local_ws.get_full(&key)?.to_vec2()?;
            assert_eq!(lhs, rhs);
        }
        Ok(())
    }

    #[test]
    fn uneven_splits_are_rejected() {
        assert!(matches!(
            Acquisition::build(&scripted_unit, 5, 2, &Device::Cpu),
            Err(TemporaError::Configuration(_))
        ));
    }

    #[test]
    fn until_all_shards_are_padded() -> Result<()> {
        let built = AtomicUsize::new(0);
        let builder = move |n_envs: usize, _device: &Device| -> crate::Result<AcquisitionUnit> {
            let done_step = 2 + 3 * built.fetch_add(1, Ordering::SeqCst);
            let envs = (0..n_envs)
                .map(|_| ScriptedEnv::new(vec![1.; 10], done_step))
                .collect();
            Ok(AcquisitionUnit::new(
                EnvAgent::no_auto_reset(envs)?,
                ConstantPolicy::parameterized(0)?,
            ))
        };
        let mut acquisition = Acquisition::build(&builder, 2, 2, &Device::Cpu)?;
        let ws = acquisition.rollout(
            0,
            &StopCondition::UntilAll(StreamKey::Done),
            ExecutionParams::evaluation(),
        )?;
        // the slower shard needs a reset and five steps
        assert_eq!(ws.time_size(), 6);
        let cumulated: Vec<Vec<f32>> = ws.get_full(&StreamKey::CumulatedReward)?.to_vec2()?;
        assert_eq!(cumulated[5], vec![2., 5.]);
        let done: Vec<Vec<u8>> = ws.get_full(&StreamKey::Done)?.to_vec2()?;
        assert_eq!(done[5], vec![1, 1]);
        Ok(())
    }

    struct FailingEnv;

    impl Env for FailingEnv {
        fn reset(&mut self, _seed: u64) -> crate::Result<Vec<f32>> {
            Ok(vec![0., 0.])
        }

        fn step(&mut self, _action: Action<'_>) -> crate::Result<SnapShot> {
            Err(TemporaError::config("simulator crashed"))
        }

        fn env_description(&self) -> EnvironmentDescription {
            EnvironmentDescription::new(Space::continuous_from_dims(&[2]), Space::Discrete(2))
        }
    }

    #[test]
    fn a_failing_worker_fails_the_round() -> Result<()> {
        let builder = |n_envs: usize, _device: &Device| -> crate::Result<AcquisitionUnit> {
            let envs = (0..n_envs).map(|_| FailingEnv).collect();
            Ok(AcquisitionUnit::new(
                EnvAgent::auto_reset(envs)?,
                ConstantPolicy::discrete(0),
            ))
        };
        let mut acquisition = Acquisition::build(&builder, 2, 2, &Device::Cpu)?;
        let result = acquisition.rollout(
            0,
            &StopCondition::Steps(3),
            ExecutionParams::acquisition(),
        );
        assert!(matches!(
            result,
            Err(TemporaError::WorkerFailed { worker: 0, .. })
        ));
        acquisition.close()?;
        Ok(())
    }
}
