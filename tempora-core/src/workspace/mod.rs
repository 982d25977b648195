mod key;
mod sampling;

pub use key::{StreamKey, StreamRole};
pub use sampling::WindowIndex;

use crate::error::{Result, TemporaError};
use candle_core::{Device, Tensor};
use std::collections::BTreeMap;

/// Time-major container of named tensor streams.
///
/// Every stream holds one tensor of shape `[B, *feature_dims]` per time index, so the full
/// stream reads as `[T, B, *feature_dims]`. All streams share `T` and `B` at all times: a write
/// past the current horizon grows every stream at once, zero filling the gap.
///
/// Tensors are stored as-is, so values produced by a differentiable computation keep their
/// gradient history until [`Workspace::detach`] produces a value-only copy.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    streams: BTreeMap<StreamKey, Vec<Tensor>>,
    time_size: usize,
    batch_size: Option<usize>,
}

fn check_compatible(key: &StreamKey, template: &Tensor, value: &Tensor) -> Result<()> {
    if template.dims() != value.dims() {
        return Err(TemporaError::shape(format!(
            "stream `{key}` holds {:?}, tried to write {:?}",
            template.dims(),
            value.dims()
        )));
    }
    if template.dtype() != value.dtype() {
        return Err(TemporaError::shape(format!(
            "stream `{key}` holds {:?}, tried to write {:?}",
            template.dtype(),
            value.dtype()
        )));
    }
    if !template.device().same_device(value.device()) {
        return Err(TemporaError::DeviceMismatch {
            expected: format!("{:?}", template.device()),
            got: format!("{:?}", value.device()),
        });
    }
    Ok(())
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of time steps currently stored.
    pub fn time_size(&self) -> usize {
        self.time_size
    }

    /// Number of parallel environment instances, zero while the workspace is empty.
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.streams.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &StreamKey> {
        self.streams.keys()
    }

    fn check_value(&self, key: &StreamKey, value: &Tensor) -> Result<usize> {
        if let Some(dtype) = key.expected_dtype() {
            if value.dtype() != dtype {
                return Err(TemporaError::shape(format!(
                    "stream `{key}` expects {dtype:?}, got {:?}",
                    value.dtype()
                )));
            }
        }
        let Some(&batch) = value.dims().first() else {
            return Err(TemporaError::shape(format!(
                "stream `{key}` needs a leading batch dimension, got a scalar"
            )));
        };
        match self.batch_size {
            Some(batch_size) if batch_size != batch => Err(TemporaError::shape(format!(
                "stream `{key}` written with batch size {batch}, workspace has {batch_size}"
            ))),
            _ => Ok(batch),
        }
    }

    fn extend_time(&mut self, time_size: usize) -> Result<()> {
        for steps in self.streams.values_mut() {
            if let Some(first) = steps.first() {
                let zeros = first.zeros_like()?;
                steps.resize(time_size, zeros);
            }
        }
        self.time_size = time_size;
        Ok(())
    }

    /// Reads the value of `key` at time `t`.
    pub fn get(&self, key: &StreamKey, t: usize) -> Result<&Tensor> {
        let steps = self
            .streams
            .get(key)
            .ok_or_else(|| TemporaError::MissingStream(key.clone()))?;
        steps.get(t).ok_or_else(|| TemporaError::OutOfRange {
            key: key.clone(),
            t,
            time_size: self.time_size,
        })
    }

    /// Writes `value` for `key` at time `t`, growing every stream when `t` is past the horizon.
    pub fn set(&mut self, key: StreamKey, t: usize, value: Tensor) -> Result<()> {
        let batch = self.check_value(&key, &value)?;
        if let Some(first) = self.streams.get(&key).and_then(|steps| steps.first()) {
            check_compatible(&key, first, &value)?;
        }
        self.batch_size = Some(batch);
        if t >= self.time_size {
            self.extend_time(t + 1)?;
        }
        match self.streams.get_mut(&key) {
            Some(steps) => steps[t] = value,
            None => {
                let zeros = value.zeros_like()?;
                let mut steps = vec![zeros; self.time_size];
                steps[t] = value;
                self.streams.insert(key, steps);
            }
        }
        Ok(())
    }

    /// Stacks a stream into a single `[T, B, ...]` tensor.
    pub fn get_full(&self, key: &StreamKey) -> Result<Tensor> {
        let steps = self
            .streams
            .get(key)
            .ok_or_else(|| TemporaError::MissingStream(key.clone()))?;
        Ok(Tensor::stack(steps, 0)?)
    }

    /// Stacks the time indices `[from, to)` of a stream.
    pub fn get_range(&self, key: &StreamKey, from: usize, to: usize) -> Result<Tensor> {
        if to > self.time_size || from >= to {
            return Err(TemporaError::OutOfRange {
                key: key.clone(),
                t: to,
                time_size: self.time_size,
            });
        }
        let steps = self
            .streams
            .get(key)
            .ok_or_else(|| TemporaError::MissingStream(key.clone()))?;
        Ok(Tensor::stack(&steps[from..to], 0)?)
    }

    /// Writes a whole `[T, B, ...]` tensor. `T` has to match the workspace unless it is empty.
    pub fn set_full(&mut self, key: StreamKey, value: Tensor) -> Result<()> {
        let time_size = value.dim(0)?;
        if !self.is_empty() && time_size != self.time_size {
            return Err(TemporaError::shape(format!(
                "stream `{key}` written with {time_size} steps, workspace has {}",
                self.time_size
            )));
        }
        for t in 0..time_size {
            self.set(key.clone(), t, value.get(t)?)?;
        }
        Ok(())
    }

    /// Value-only copy of the workspace: same values, no gradient history.
    pub fn detach(&self) -> Workspace {
        let streams = self
            .streams
            .iter()
            .map(|(key, steps)| (key.clone(), steps.iter().map(Tensor::detach).collect()))
            .collect();
        Self {
            streams,
            time_size: self.time_size,
            batch_size: self.batch_size,
        }
    }

    /// Successor workspace seeded with the last `n` steps, so that a new rollout can continue
    /// from where this one stopped. The result has `time_size() == n`.
    pub fn copy_n_last_steps(&self, n: usize) -> Result<Workspace> {
        if n > self.time_size {
            return Err(TemporaError::config(format!(
                "cannot keep the last {n} steps of a workspace holding {}",
                self.time_size
            )));
        }
        self.narrow_time(self.time_size - n, n)
    }

    /// Keeps the time indices `[from, from + len)`.
    pub fn narrow_time(&self, from: usize, len: usize) -> Result<Workspace> {
        if from + len > self.time_size {
            return Err(TemporaError::config(format!(
                "time window [{from}, {}) exceeds the workspace horizon {}",
                from + len,
                self.time_size
            )));
        }
        if len == 0 {
            return Ok(Self::new());
        }
        let streams = self
            .streams
            .iter()
            .map(|(key, steps)| (key.clone(), steps[from..from + len].to_vec()))
            .collect();
        Ok(Self {
            streams,
            time_size: len,
            batch_size: self.batch_size,
        })
    }

    /// Keeps the given environment indices, in order.
    pub fn select_batch(&self, indices: &[usize]) -> Result<Workspace> {
        let batch_size = self.batch_size();
        if let Some(idx) = indices.iter().find(|idx| **idx >= batch_size) {
            return Err(TemporaError::config(format!(
                "environment index {idx} out of range for batch size {batch_size}"
            )));
        }
        let ids = indices.iter().map(|i| *i as u32).collect::<Vec<_>>();
        let mut streams = BTreeMap::new();
        for (key, steps) in self.streams.iter() {
            let ids = Tensor::from_slice(&ids, ids.len(), steps[0].device())?;
            let selected = steps
                .iter()
                .map(|step| step.index_select(&ids, 0))
                .collect::<candle_core::Result<Vec<_>>>()?;
            streams.insert(key.clone(), selected);
        }
        Ok(Self {
            streams,
            time_size: self.time_size,
            batch_size: Some(indices.len()),
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Workspace> {
        let mut streams = BTreeMap::new();
        for (key, steps) in self.streams.iter() {
            let moved = steps
                .iter()
                .map(|step| step.to_device(device))
                .collect::<candle_core::Result<Vec<_>>>()?;
            streams.insert(key.clone(), moved);
        }
        Ok(Self {
            streams,
            time_size: self.time_size,
            batch_size: self.batch_size,
        })
    }

    /// Repeats the final step until the workspace holds `time_size` steps.
    pub fn pad_time(&self, time_size: usize) -> Result<Workspace> {
        if time_size < self.time_size || self.time_size == 0 {
            return Err(TemporaError::config(format!(
                "cannot pad a workspace of {} steps to {time_size}",
                self.time_size
            )));
        }
        let streams = self
            .streams
            .iter()
            .map(|(key, steps)| {
                let mut padded = steps.clone();
                padded.resize(time_size, steps[steps.len() - 1].clone());
                (key.clone(), padded)
            })
            .collect();
        Ok(Self {
            streams,
            time_size,
            batch_size: self.batch_size,
        })
    }

    /// Concatenates workspaces along the batch axis, preserving time alignment.
    pub fn concat_batch(shards: &[Workspace]) -> Result<Workspace> {
        let Some(first) = shards.first() else {
            return Ok(Workspace::new());
        };
        if let Some(shard) = shards.iter().find(|shard| shard.time_size != first.time_size) {
            return Err(TemporaError::shape(format!(
                "cannot merge shards with {} and {} time steps",
                first.time_size, shard.time_size
            )));
        }
        let keys = shards
            .iter()
            .flat_map(|shard| shard.streams.iter())
            .filter_map(|(key, steps)| Some((key.clone(), steps.first()?.clone())))
            .collect::<BTreeMap<_, _>>();
        let mut streams = BTreeMap::new();
        for (key, template) in keys {
            let partial = shards.iter().any(|shard| !shard.contains(&key));
            // auxiliary streams such as success are only written by some environments
            if partial && key.role() != StreamRole::Auxiliary {
                return Err(TemporaError::shape(format!(
                    "stream `{key}` is missing from some shards"
                )));
            }
            let mut merged = Vec::with_capacity(first.time_size);
            for t in 0..first.time_size {
                let parts = shards
                    .iter()
                    .map(|shard| match shard.streams.get(&key) {
                        Some(steps) => Ok(steps[t].clone()),
                        None => {
                            let mut dims = template.dims().to_vec();
                            dims[0] = shard.batch_size();
                            Ok(Tensor::zeros(dims, template.dtype(), template.device())?)
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                merged.push(Tensor::cat(&parts, 0)?);
            }
            streams.insert(key, merged);
        }
        Ok(Self {
            streams,
            time_size: first.time_size,
            batch_size: Some(shards.iter().map(Workspace::batch_size).sum()),
        })
    }
}
