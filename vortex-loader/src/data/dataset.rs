//! In-memory decoded shards
//!
//! A [`DataSet`] is the decoded form of one shard file: an ordered list of
//! samples, each a dense vector of tensors indexed by input position.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::tensor::{DataType, TensorRecord};
use crate::error::{LoaderError, Result};

/// One training example: one optional tensor per configured input
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    features: Vec<Option<TensorRecord>>,
}

impl Sample {
    /// Sample with `width` empty feature slots
    pub fn with_width(width: usize) -> Self {
        Self {
            features: vec![None; width],
        }
    }

    /// Sample from fully populated features
    pub fn from_features(features: Vec<TensorRecord>) -> Self {
        Self {
            features: features.into_iter().map(Some).collect(),
        }
    }

    /// Number of feature slots
    pub fn width(&self) -> usize {
        self.features.len()
    }

    /// Feature at input position `idx`
    pub fn feature(&self, idx: usize) -> Option<&TensorRecord> {
        self.features.get(idx).and_then(|f| f.as_ref())
    }

    /// Store a feature at input position `idx`; ignored if out of range
    pub fn set_feature(&mut self, idx: usize, tensor: TensorRecord) {
        if let Some(slot) = self.features.get_mut(idx) {
            *slot = Some(tensor);
        }
    }

    pub fn features(&self) -> &[Option<TensorRecord>] {
        &self.features
    }
}

/// Decoded shard: samples sharing one input-name schema
#[derive(Debug, Clone)]
pub struct DataSet {
    /// Internal tensor names, one per feature slot
    tensor_names: Arc<[String]>,
    samples: Vec<Sample>,
}

impl DataSet {
    /// Create an empty data set for the given schema
    pub fn new(tensor_names: Arc<[String]>) -> Self {
        Self {
            tensor_names,
            samples: Vec::new(),
        }
    }

    /// Append one sample
    pub fn add_data(&mut self, sample: Sample) -> Result<()> {
        if sample.width() != self.num_inputs() {
            return Err(LoaderError::invalid(format!(
                "sample has {} features, data set expects {}",
                sample.width(),
                self.num_inputs()
            )));
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn num_inputs(&self) -> usize {
        self.tensor_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn tensor_names(&self) -> &[String] {
        &self.tensor_names
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sample(&self, idx: usize) -> Option<&Sample> {
        self.samples.get(idx)
    }

    /// Number of batches of `batch_size` (last one may be short)
    pub fn total_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            return 0;
        }
        self.samples.len().div_ceil(batch_size)
    }

    /// Stack the `k`-th batch into one tensor per input
    ///
    /// The returned tensors are named after the internal tensor names and
    /// have shape `[rows] ++ sample_shape`.
    pub fn kth_batch(&self, batch_size: usize, k: usize) -> Result<Vec<TensorRecord>> {
        if batch_size == 0 {
            return Err(LoaderError::invalid("batch_size must be > 0"));
        }
        let total = self.total_batches(batch_size);
        if k >= total {
            return Err(LoaderError::invalid(format!(
                "batch {} out of range, data set has {} batches",
                k, total
            )));
        }

        let start = k * batch_size;
        let end = (start + batch_size).min(self.samples.len());
        let rows = &self.samples[start..end];

        (0..self.num_inputs())
            .map(|input| self.stack_input(rows, input, start))
            .collect()
    }

    /// Concatenate one input across `rows` along a new leading dimension
    fn stack_input(
        &self,
        rows: &[Sample],
        input: usize,
        first_row: usize,
    ) -> Result<TensorRecord> {
        let name = &self.tensor_names[input];
        let mut head: Option<&TensorRecord> = None;
        let mut data = BytesMut::new();
        let mut strings = Vec::new();

        for (offset, sample) in rows.iter().enumerate() {
            let tensor = sample.feature(input).ok_or_else(|| {
                LoaderError::invalid(format!(
                    "sample {} has no feature for input '{}'",
                    first_row + offset,
                    name
                ))
            })?;

            match head {
                None => head = Some(tensor),
                Some(first) if first.data_type != tensor.data_type || first.dims != tensor.dims => {
                    return Err(LoaderError::invalid(format!(
                        "input '{}': sample {} has type {} shape {:?}, expected type {} shape {:?}",
                        name,
                        first_row + offset,
                        tensor.data_type,
                        tensor.dims,
                        first.data_type,
                        first.dims
                    )));
                }
                Some(_) => {}
            }
            data.extend_from_slice(&tensor.raw_data);
            strings.extend(tensor.string_data.iter().cloned());
        }

        // rows is never empty for an in-range batch
        let first = head.ok_or_else(|| LoaderError::Internal {
            message: "empty batch".into(),
        })?;

        let mut dims = Vec::with_capacity(first.dims.len() + 1);
        dims.push(rows.len() as i64);
        dims.extend_from_slice(&first.dims);

        Ok(TensorRecord {
            dims,
            data_type: first.data_type,
            name: name.clone(),
            raw_data: data.freeze(),
            string_data: strings,
            ..Default::default()
        })
    }
}

/// Synthetic data set generator for tests and smoke runs
pub struct RandomDataSet {
    rng: StdRng,
}

impl RandomDataSet {
    /// Create a generator with a fixed seed
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generate `num_samples` samples with the given per-input shapes and types
    ///
    /// Records are named after `names`. Float inputs are uniform in `[0, 1)`;
    /// other fixed-width types get random bytes.
    pub fn generate(
        &mut self,
        num_samples: usize,
        names: &[String],
        shapes: &[Vec<i64>],
        types: &[DataType],
    ) -> Result<DataSet> {
        if names.len() != shapes.len() || names.len() != types.len() {
            return Err(LoaderError::invalid(format!(
                "{} names, {} shapes and {} types must match",
                names.len(),
                shapes.len(),
                types.len()
            )));
        }

        let mut data_set = DataSet::new(names.to_vec().into());
        for _ in 0..num_samples {
            let features = names
                .iter()
                .zip(shapes)
                .zip(types)
                .map(|((name, shape), &dtype)| self.tensor(name, shape, dtype))
                .collect::<Result<Vec<_>>>()?;
            data_set.add_data(Sample::from_features(features))?;
        }
        Ok(data_set)
    }

    fn tensor(&mut self, name: &str, shape: &[i64], dtype: DataType) -> Result<TensorRecord> {
        let width = dtype
            .size_in_bytes()
            .ok_or_else(|| LoaderError::invalid(format!("cannot generate {:?} data", dtype)))?;
        let count: i64 = shape.iter().product();
        if count < 0 {
            return Err(LoaderError::invalid(format!("negative shape {:?}", shape)));
        }
        let count = count as usize;

        let raw = if dtype == DataType::Float {
            (0..count)
                .flat_map(|_| self.rng.gen::<f32>().to_le_bytes())
                .collect::<Vec<u8>>()
        } else {
            let mut raw = vec![0u8; count * width];
            self.rng.fill(raw.as_mut_slice());
            raw
        };

        Ok(TensorRecord::new(name, dtype, shape.to_vec(), Bytes::from(raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Arc<[String]> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into()
    }

    fn sample(x: &[f32], label: i64) -> Sample {
        Sample::from_features(vec![
            TensorRecord::from_f32("x", vec![x.len() as i64], x),
            TensorRecord::from_i64("y", vec![1], &[label]),
        ])
    }

    #[test]
    fn test_add_data_checks_width() {
        let mut ds = DataSet::new(names(&["x", "y"]));
        assert!(ds.add_data(Sample::with_width(1)).is_err());
        ds.add_data(Sample::with_width(2)).unwrap();
        assert_eq!(ds.num_samples(), 1);
    }

    #[test]
    fn test_kth_batch_stacks_rows() {
        let mut ds = DataSet::new(names(&["x", "y"]));
        for i in 0..5 {
            ds.add_data(sample(&[i as f32, i as f32 + 0.5], i)).unwrap();
        }
        assert_eq!(ds.total_batches(2), 3);

        let batch = ds.kth_batch(2, 1).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].name, "x");
        assert_eq!(batch[0].dims, vec![2, 2]);
        assert_eq!(batch[0].to_f32().unwrap(), vec![2.0, 2.5, 3.0, 3.5]);
        assert_eq!(batch[1].to_i64().unwrap(), vec![2, 3]);

        // short last batch
        let last = ds.kth_batch(2, 2).unwrap();
        assert_eq!(last[0].dims, vec![1, 2]);

        assert!(ds.kth_batch(2, 3).is_err());
        assert!(ds.kth_batch(0, 0).is_err());
    }

    #[test]
    fn test_kth_batch_rejects_missing_and_mismatched() {
        let mut ds = DataSet::new(names(&["x", "y"]));
        ds.add_data(sample(&[1.0], 0)).unwrap();
        ds.add_data(Sample::with_width(2)).unwrap();
        assert!(ds.kth_batch(2, 0).is_err());

        let mut ds = DataSet::new(names(&["x", "y"]));
        ds.add_data(sample(&[1.0], 0)).unwrap();
        ds.add_data(sample(&[1.0, 2.0], 1)).unwrap();
        assert!(ds.kth_batch(2, 0).is_err());
    }

    #[test]
    fn test_random_data_set_is_seeded() {
        let names = vec!["x".to_string(), "labels".to_string()];
        let shapes = vec![vec![1, 784], vec![1, 10]];
        let types = vec![DataType::Float, DataType::Float];

        let a = RandomDataSet::new(7).generate(3, &names, &shapes, &types).unwrap();
        let b = RandomDataSet::new(7).generate(3, &names, &shapes, &types).unwrap();
        assert_eq!(a.num_samples(), 3);
        assert_eq!(a.samples(), b.samples());
        assert_eq!(a.sample(0).unwrap().feature(0).unwrap().raw_data.len(), 784 * 4);

        let batch = a.kth_batch(3, 0).unwrap();
        assert_eq!(batch[1].dims, vec![3, 1, 10]);
    }
}
