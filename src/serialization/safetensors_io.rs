//! File-backed weight store in the SafeTensors format.
//!
//! Each weight becomes one tensor named `unit/position` (see
//! [`WeightKey`]), stored in its own dtype. All dtypes of [`Value`] are
//! supported.

use super::{WeightKey, WeightStore};
use crate::error::{Result, UnitError};
use crate::value::Value;
use half::f16;
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{SafeTensors, TensorView};
use safetensors::{serialize, serialize_to_file, Dtype};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const STORE: &str = "safetensors";

#[derive(Debug, Clone, Default)]
pub struct SafeTensorsStore {
    values: BTreeMap<WeightKey, Value>,
}

impl SafeTensorsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let encoded = self.encoded();
        serialize_to_file(self.views(&encoded)?, &None, path.as_ref())?;
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Self::from_bytes(&buffer)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let encoded = self.encoded();
        Ok(serialize(self.views(&encoded)?, &None)?)
    }

    pub fn from_bytes(buffer: &[u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(buffer)?;
        let mut values = BTreeMap::new();
        for (name, view) in tensors.tensors() {
            let key = WeightKey::parse(&name).ok_or_else(|| {
                UnitError::state(STORE, format!("tensor name '{}' is not a weight key", name))
            })?;
            values.insert(key, decode(&name, view.dtype(), view.shape(), view.data())?);
        }
        Ok(Self { values })
    }

    fn encoded(&self) -> Vec<(String, Dtype, Vec<usize>, Vec<u8>)> {
        self.values
            .iter()
            .map(|(key, value)| {
                let (dtype, bytes) = encode(value);
                (key.to_string(), dtype, value.dims(), bytes)
            })
            .collect()
    }

    fn views<'a>(
        &self,
        encoded: &'a [(String, Dtype, Vec<usize>, Vec<u8>)],
    ) -> Result<Vec<(&'a str, TensorView<'a>)>> {
        encoded
            .iter()
            .map(|(name, dtype, shape, bytes)| {
                Ok((name.as_str(), TensorView::new(*dtype, shape.clone(), bytes)?))
            })
            .collect()
    }
}

impl WeightStore for SafeTensorsStore {
    fn put(&mut self, key: WeightKey, value: Value) -> Result<()> {
        self.values.insert(key, value);
        Ok(())
    }

    fn get(&self, key: &WeightKey) -> Result<Option<Value>> {
        Ok(self.values.get(key).cloned())
    }

    fn count_for(&self, unit: &str) -> usize {
        self.values.keys().filter(|k| k.unit == unit).count()
    }
}

fn encode(value: &Value) -> (Dtype, Vec<u8>) {
    match value {
        Value::F16(a) => (Dtype::F16, a.iter().flat_map(|x| x.to_le_bytes()).collect()),
        Value::F32(a) => (Dtype::F32, a.iter().flat_map(|x| x.to_le_bytes()).collect()),
        Value::F64(a) => (Dtype::F64, a.iter().flat_map(|x| x.to_le_bytes()).collect()),
        Value::I32(a) => (Dtype::I32, a.iter().flat_map(|x| x.to_le_bytes()).collect()),
        Value::I64(a) => (Dtype::I64, a.iter().flat_map(|x| x.to_le_bytes()).collect()),
        Value::Bool(a) => (Dtype::BOOL, a.iter().map(|&x| x as u8).collect()),
    }
}

fn decode(name: &str, dtype: Dtype, shape: &[usize], data: &[u8]) -> Result<Value> {
    fn array<T, const N: usize>(
        name: &str,
        shape: &[usize],
        data: &[u8],
        from: impl Fn([u8; N]) -> T,
    ) -> Result<ArrayD<T>> {
        let items: Vec<T> = data
            .chunks_exact(N)
            .map(|chunk| {
                let mut bytes = [0u8; N];
                bytes.copy_from_slice(chunk);
                from(bytes)
            })
            .collect();
        let count = items.len();
        ArrayD::from_shape_vec(IxDyn(shape), items).map_err(|_| {
            UnitError::state(
                STORE,
                format!("tensor '{}' has {} elements, which does not fit shape {:?}", name, count, shape),
            )
        })
    }

    Ok(match dtype {
        Dtype::F16 => Value::F16(array(name, shape, data, f16::from_le_bytes)?),
        Dtype::F32 => Value::F32(array(name, shape, data, f32::from_le_bytes)?),
        Dtype::F64 => Value::F64(array(name, shape, data, f64::from_le_bytes)?),
        Dtype::I32 => Value::I32(array(name, shape, data, i32::from_le_bytes)?),
        Dtype::I64 => Value::I64(array(name, shape, data, i64::from_le_bytes)?),
        Dtype::BOOL => Value::Bool(array(name, shape, data, |[b]: [u8; 1]| b != 0)?),
        other => {
            return Err(UnitError::state(
                STORE,
                format!("tensor '{}' has unsupported dtype {:?}", name, other),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn test_bytes_round_trip_keeps_dtypes() {
        let mut store = SafeTensorsStore::new();
        let weights = [
            Value::filled(&[2, 3], 0.5, DType::F32),
            Value::filled(&[4], -1.25, DType::F16),
            Value::filled(&[1], 3.0, DType::F64),
            Value::filled(&[2], 7.0, DType::I64),
        ];
        for (i, w) in weights.iter().enumerate() {
            store.put(WeightKey::new("dense", i), w.clone()).unwrap();
        }
        let restored = SafeTensorsStore::from_bytes(&store.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.count_for("dense"), 4);
        for (i, w) in weights.iter().enumerate() {
            assert_eq!(restored.get(&WeightKey::new("dense", i)).unwrap().as_ref(), Some(w));
        }
    }

    #[test]
    fn test_rejects_foreign_tensor_names() {
        let data = vec![0u8; 4];
        let view = TensorView::new(Dtype::F32, vec![1], &data).unwrap();
        let bytes = serialize(vec![("not-a-key", view)], &None).unwrap();
        assert!(SafeTensorsStore::from_bytes(&bytes).unwrap_err().is_state());
    }
}
