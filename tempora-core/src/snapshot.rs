use crate::error::{Result, TemporaError};
use bincode::{Decode, Encode};
use candle_core::{Device, Error, Tensor, safetensors::BufferedSafetensors};
use candle_nn::VarMap;
use safetensors::serialize;

/// Immutable copy of a parameter set, used to ship weights to acquisition units.
///
/// The tensors are stored as a safetensors buffer, so a snapshot owns its bytes and never
/// aliases the trainer's live parameters.
#[derive(Debug, Clone, Encode, Decode)]
pub struct PolicySnapshot {
    names: Vec<String>,
    tensors: Vec<u8>,
}

impl PolicySnapshot {
    pub fn from_varmap(varmap: &VarMap) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|err| TemporaError::LockPoisoned(err.to_string()))?;
        let mut named = data
            .iter()
            .map(|(name, var)| {
                let tensor = var.as_tensor().detach().to_device(&Device::Cpu)?;
                Ok((name.clone(), tensor))
            })
            .collect::<Result<Vec<(String, Tensor)>>>()?;
        named.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));
        let tensors = serialize(
            named.iter().map(|(name, tensor)| (name.as_str(), tensor)),
            None,
        )
        .map_err(Error::wrap)?;
        Ok(Self {
            names: named.into_iter().map(|(name, _)| name).collect(),
            tensors,
        })
    }

    /// Names of the stored tensors, sorted.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Loads a single tensor onto `device`.
    pub fn tensor(&self, name: &str, device: &Device) -> Result<Tensor> {
        let buffered = BufferedSafetensors::new(self.tensors.clone())?;
        Ok(buffered.load(name, device)?)
    }

    /// Overwrites every variable of `varmap` with the stored value, on the variable's device.
    /// Both sides have to hold exactly the same names and shapes.
    pub fn load_into(&self, varmap: &VarMap) -> Result<()> {
        let buffered = BufferedSafetensors::new(self.tensors.clone())?;
        let data = varmap
            .data()
            .lock()
            .map_err(|err| TemporaError::LockPoisoned(err.to_string()))?;
        if data.len() != self.names.len() {
            return Err(TemporaError::shape(format!(
                "snapshot holds {} tensors, parameter set has {}",
                self.names.len(),
                data.len()
            )));
        }
        for (name, var) in data.iter() {
            if !self.names.contains(name) {
                return Err(TemporaError::shape(format!(
                    "parameter `{name}` is missing from the snapshot"
                )));
            }
            let value = buffered.load(name, var.device())?;
            if value.dims() != var.dims() {
                return Err(TemporaError::shape(format!(
                    "parameter `{name}` is {:?}, snapshot holds {:?}",
                    var.dims(),
                    value.dims()
                )));
            }
            var.set(&value)?;
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (snapshot, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::DType;
    use candle_nn::{Init, VarMap};

    fn varmap(value: f64) -> candle_core::Result<VarMap> {
        let varmap = VarMap::new();
        varmap.get((2, 3), "layer0.weight", Init::Const(value), DType::F32, &Device::Cpu)?;
        varmap.get(3, "layer0.bias", Init::Const(value), DType::F32, &Device::Cpu)?;
        Ok(varmap)
    }

    #[test]
    fn loads_values_into_another_parameter_set() -> Result<()> {
        let source = varmap(1.5)?;
        let target = varmap(0.)?;
        let bytes = PolicySnapshot::from_varmap(&source)?.encode()?;
        let snapshot = PolicySnapshot::decode(&bytes)?;
        assert_eq!(snapshot.names(), ["layer0.bias", "layer0.weight"]);
        snapshot.load_into(&target)?;
        let data = target.data().lock().map_err(|err| anyhow::anyhow!("{err}"))?;
        let weight: Vec<Vec<f32>> = data["layer0.weight"].as_tensor().to_vec2()?;
        assert_eq!(weight, vec![vec![1.5; 3]; 2]);
        Ok(())
    }

    #[test]
    fn snapshot_does_not_alias_the_source() -> Result<()> {
        let source = varmap(1.)?;
        let snapshot = PolicySnapshot::from_varmap(&source)?;
        {
            let data = source.data().lock().map_err(|err| anyhow::anyhow!("{err}"))?;
            data["layer0.bias"].set(&Tensor::zeros(3, DType::F32, &Device::Cpu)?)?;
        }
        let bias: Vec<f32> = snapshot.tensor("layer0.bias", &Device::Cpu)?.to_vec1()?;
        assert_eq!(bias, vec![1.; 3]);
        Ok(())
    }

    #[test]
    fn mismatched_parameter_sets_are_rejected() -> Result<()> {
        let source = varmap(1.)?;
        let target = VarMap::new();
        target.get((2, 4), "layer0.weight", Init::Const(0.), DType::F32, &Device::Cpu)?;
        target.get(3, "layer0.bias", Init::Const(0.), DType::F32, &Device::Cpu)?;
        let snapshot = PolicySnapshot::from_varmap(&source)?;
        assert!(matches!(
            snapshot.load_into(&target),
            Err(TemporaError::ShapeMismatch(_))
        ));
        Ok(())
    }
}
