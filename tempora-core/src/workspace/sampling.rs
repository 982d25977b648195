use super::Workspace;
use crate::error::{Result, TemporaError};
use rand::Rng;

/// One drawn minibatch window: a time start and the environments kept for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowIndex {
    pub start: usize,
    pub envs: Vec<usize>,
}

impl Workspace {
    fn check_window(&self, n_times: usize, n_envs: usize, n_timesteps: usize) -> Result<()> {
        if n_times == 0 || n_envs == 0 || n_timesteps == 0 {
            return Err(TemporaError::config(format!(
                "minibatch dimensions must be positive, got n_times={n_times} n_envs={n_envs} n_timesteps={n_timesteps}"
            )));
        }
        if n_timesteps > self.time_size() {
            return Err(TemporaError::config(format!(
                "minibatch needs {n_timesteps} time steps, workspace holds {}",
                self.time_size()
            )));
        }
        if n_envs > self.batch_size() {
            return Err(TemporaError::config(format!(
                "minibatch needs {n_envs} environments, workspace holds {}",
                self.batch_size()
            )));
        }
        Ok(())
    }

    /// Draws `n_times` independent windows. Starts are uniform over every window that fits,
    /// environments are drawn without replacement within a window.
    pub fn draw_windows<R: Rng + ?Sized>(
        &self,
        n_times: usize,
        n_envs: usize,
        n_timesteps: usize,
        rng: &mut R,
    ) -> Result<Vec<WindowIndex>> {
        self.check_window(n_times, n_envs, n_timesteps)?;
        let last_start = self.time_size() - n_timesteps;
        Ok((0..n_times)
            .map(|_| {
                let start = rng.random_range(0..=last_start);
                let envs = rand::seq::index::sample(rng, self.batch_size(), n_envs).into_vec();
                WindowIndex { start, envs }
            })
            .collect())
    }

    /// Materializes the given windows into a standalone workspace, windows concatenated along
    /// the batch axis.
    pub fn gather_windows(&self, windows: &[WindowIndex], n_timesteps: usize) -> Result<Workspace> {
        let shards = windows
            .iter()
            .map(|window| {
                self.narrow_time(window.start, n_timesteps)?
                    .select_batch(&window.envs)
            })
            .collect::<Result<Vec<_>>>()?;
        Workspace::concat_batch(&shards)
    }

    /// Minibatch of shape `[n_timesteps, n_times * n_envs, ...]`.
    pub fn sample_subworkspace<R: Rng + ?Sized>(
        &self,
        n_times: usize,
        n_envs: usize,
        n_timesteps: usize,
        rng: &mut R,
    ) -> Result<Workspace> {
        let windows = self.draw_windows(n_times, n_envs, n_timesteps, rng)?;
        self.gather_windows(&windows, n_timesteps)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::TemporaError;
    use crate::workspace::{StreamKey, Workspace};
    use anyhow::Result;
    use candle_core::{Device, Tensor};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn numbered(time_size: usize, batch_size: usize) -> Result<Workspace> {
        let mut ws = Workspace::new();
        let values = Tensor::arange(0u32, (time_size * batch_size) as u32, &Device::Cpu)?
            .to_dtype(candle_core::DType::F32)?
            .reshape((time_size, batch_size))?;
        ws.set_full(StreamKey::Critic, values.clone())?;
        ws.set_full(StreamKey::Reward, (values * 2.)?)?;
        Ok(ws)
    }

    #[test]
    fn sampled_values_match_the_source_slice() -> Result<()> {
        let ws = numbered(10, 6)?;
        let mut rng = StdRng::seed_from_u64(7);
        let windows = ws.draw_windows(1, 4, 3, &mut rng.clone())?;
        let sample = ws.sample_subworkspace(1, 4, 3, &mut rng)?;
        assert_eq!(sample.time_size(), 3);
        assert_eq!(sample.batch_size(), 4);
        let window = &windows[0];
        let critic: Vec<Vec<f32>> = sample.get_full(&StreamKey::Critic)?.to_vec2()?;
        let reward: Vec<Vec<f32>> = sample.get_full(&StreamKey::Reward)?.to_vec2()?;
        for dt in 0..3 {
            for (i, env) in window.envs.iter().enumerate() {
                let expected = ((window.start + dt) * 6 + env) as f32;
                assert_eq!(critic[dt][i], expected);
                assert_eq!(reward[dt][i], expected * 2.);
            }
        }
        Ok(())
    }

    #[test]
    fn windows_fit_and_envs_are_distinct() -> Result<()> {
        let ws = numbered(8, 5)?;
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..50 {
            let windows = ws.draw_windows(3, 5, 8, &mut rng)?;
            for window in windows {
                assert_eq!(window.start, 0);
                let mut envs = window.envs.clone();
                envs.sort();
                assert_eq!(envs, vec![0, 1, 2, 3, 4]);
            }
            let windows = ws.draw_windows(2, 2, 3, &mut rng)?;
            for window in windows {
                assert!(window.start + 3 <= 8);
                assert_ne!(window.envs[0], window.envs[1]);
            }
        }
        Ok(())
    }

    #[test]
    fn windows_concatenate_along_batch() -> Result<()> {
        let ws = numbered(6, 4)?;
        let mut rng = StdRng::seed_from_u64(3);
        let sample = ws.sample_subworkspace(3, 2, 4, &mut rng)?;
        assert_eq!(sample.time_size(), 4);
        assert_eq!(sample.batch_size(), 6);
        Ok(())
    }

    #[test]
    fn oversized_windows_are_configuration_errors() -> Result<()> {
        let ws = numbered(4, 2)?;
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            ws.sample_subworkspace(1, 2, 5, &mut rng),
            Err(TemporaError::Configuration(_))
        ));
        assert!(matches!(
            ws.sample_subworkspace(1, 3, 2, &mut rng),
            Err(TemporaError::Configuration(_))
        ));
        assert!(matches!(
            ws.sample_subworkspace(0, 1, 1, &mut rng),
            Err(TemporaError::Configuration(_))
        ));
        Ok(())
    }
}
