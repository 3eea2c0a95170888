//! Shard file framing
//!
//! A shard file is a concatenation of samples:
//!
//! ```text
//! sample  := u32 sample_size, feature*   (features fill exactly sample_size bytes)
//! feature := u32 feature_size, TensorRecord bytes
//! ```
//!
//! Lengths are little-endian. A clean end of file between samples ends the
//! stream; anything shorter is a truncated shard.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use super::dataset::{DataSet, Sample};
use super::tensor::TensorRecord;
use crate::error::{LoaderError, Result};

const LEN_PREFIX: usize = std::mem::size_of::<u32>();

/// Precomputed name → feature slot table
///
/// Built once from the input name map. Position `i` is the `i`-th entry of
/// the map in key order; records are routed by their declared name, which
/// may be either the external name (map key) or the internal tensor name
/// (map value). Keys win if both match different entries.
#[derive(Debug, Clone)]
pub struct FeatureIndex {
    tensor_names: Arc<[String]>,
    slots: HashMap<String, usize>,
}

impl FeatureIndex {
    pub fn new(input_name_map: &BTreeMap<String, String>) -> Self {
        let mut slots = HashMap::with_capacity(input_name_map.len() * 2);
        let mut tensor_names = Vec::with_capacity(input_name_map.len());

        for (idx, (external, internal)) in input_name_map.iter().enumerate() {
            tensor_names.push(internal.clone());
            slots.insert(external.clone(), idx);
        }
        for (idx, internal) in tensor_names.iter().enumerate() {
            slots.entry(internal.clone()).or_insert(idx);
        }

        Self {
            tensor_names: tensor_names.into(),
            slots,
        }
    }

    /// Slot for a record's declared name
    pub fn position(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }

    /// Internal tensor names in slot order
    pub fn tensor_names(&self) -> Arc<[String]> {
        self.tensor_names.clone()
    }

    pub fn names(&self) -> &[String] {
        &self.tensor_names
    }

    pub fn len(&self) -> usize {
        self.tensor_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensor_names.is_empty()
    }
}

/// Bounds-checked cursor over a frame of shard bytes
struct FrameReader {
    data: Bytes,
    pos: usize,
    /// Offset of `data` within the file, for error reporting
    base: usize,
}

impl FrameReader {
    fn new(data: Bytes, base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn take(&mut self, len: usize) -> Result<Bytes> {
        let available = self.data.len() - self.pos;
        if len > available {
            return Err(LoaderError::Truncated {
                offset: self.offset(),
                needed: len,
                available,
            });
        }
        let out = self.data.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(LEN_PREFIX)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

/// Turns shard bytes into a [`DataSet`]
///
/// `raw_data` payloads are zero-copy slices of the shard buffer; typed
/// payloads are copied into `raw_data` once, at decode time.
#[derive(Debug, Clone)]
pub struct SampleDecoder {
    index: Arc<FeatureIndex>,
}

impl SampleDecoder {
    pub fn new(index: Arc<FeatureIndex>) -> Self {
        Self { index }
    }

    pub fn feature_index(&self) -> &FeatureIndex {
        &self.index
    }

    /// Decode a whole shard; never returns a partial data set
    pub fn decode(&self, data: Bytes) -> Result<DataSet> {
        let mut reader = FrameReader::new(data, 0);
        let mut data_set = DataSet::new(self.index.tensor_names());

        while !reader.is_empty() {
            let sample_size = reader.read_u32()? as usize;
            let base = reader.offset();
            let body = reader.take(sample_size)?;
            let sample = self.decode_sample(FrameReader::new(body, base))?;
            data_set.add_data(sample)?;
        }

        Ok(data_set)
    }

    fn decode_sample(&self, mut body: FrameReader) -> Result<Sample> {
        let mut sample = Sample::with_width(self.index.len());

        while !body.is_empty() {
            let feature_size = body.read_u32()? as usize;
            let offset = body.offset();
            let raw = body.take(feature_size)?;

            let mut tensor = TensorRecord::decode(raw).map_err(|e| LoaderError::Decode {
                offset,
                reason: e.to_string(),
            })?;

            if let Some(idx) = self.index.position(&tensor.name) {
                tensor
                    .normalize_payload()
                    .map_err(|reason| LoaderError::Decode { offset, reason })?;
                sample.set_feature(idx, tensor);
            }
        }

        Ok(sample)
    }

    /// Read and decode a shard file
    pub fn decode_file(&self, path: &Path) -> Result<DataSet> {
        let data = std::fs::read(path).map_err(|e| LoaderError::io(path, e))?;
        self.decode(Bytes::from(data))
    }
}

/// Read a shard file into memory on the async runtime
pub async fn read_shard(path: &Path) -> Result<Bytes> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|e| LoaderError::io(path, e))
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        LoaderError::invalid(format!("frame of {} bytes exceeds u32 length prefix", len))
    })
}

/// Frame one sample, length prefix included
pub fn encode_sample(features: &[TensorRecord]) -> Result<Bytes> {
    let mut body = BytesMut::new();
    for feature in features {
        let len = feature.encoded_len();
        body.reserve(LEN_PREFIX + len);
        body.put_u32_le(frame_len(len)?);
        feature
            .encode(&mut body)
            .map_err(|e| LoaderError::Internal {
                message: format!("tensor encode failed: {}", e),
            })?;
    }

    let mut out = BytesMut::with_capacity(LEN_PREFIX + body.len());
    out.put_u32_le(frame_len(body.len())?);
    out.extend_from_slice(&body);
    Ok(out.freeze())
}

/// Frame a list of samples into one shard image
pub fn encode_shard(samples: &[Vec<TensorRecord>]) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for sample in samples {
        out.extend_from_slice(&encode_sample(sample)?);
    }
    Ok(out.freeze())
}

/// Streams samples into a shard file
pub struct ShardWriter<W: Write> {
    inner: W,
    samples: usize,
}

impl<W: Write> ShardWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, samples: 0 }
    }

    pub fn write_sample(&mut self, features: &[TensorRecord]) -> Result<()> {
        let framed = encode_sample(features)?;
        self.inner
            .write_all(&framed)
            .map_err(|e| LoaderError::io("<shard writer>", e))?;
        self.samples += 1;
        Ok(())
    }

    /// Samples written so far
    pub fn samples_written(&self) -> usize {
        self.samples
    }

    /// Flush and hand back the sink
    pub fn finish(mut self) -> Result<W> {
        self.inner
            .flush()
            .map_err(|e| LoaderError::io("<shard writer>", e))?;
        Ok(self.inner)
    }
}

/// Write a complete shard file
pub fn write_shard(path: &Path, samples: &[Vec<TensorRecord>]) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|e| LoaderError::io(path, e))?;
    let mut writer = ShardWriter::new(std::io::BufWriter::new(file));
    for sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(pairs: &[(&str, &str)]) -> SampleDecoder {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SampleDecoder::new(Arc::new(FeatureIndex::new(&map)))
    }

    #[test]
    fn test_feature_index_follows_key_order() {
        let dec = decoder(&[("label", "labels"), ("image", "X")]);
        let index = dec.feature_index();
        assert_eq!(&*index.tensor_names(), &["X".to_string(), "labels".to_string()]);
        assert_eq!(index.position("image"), Some(0));
        assert_eq!(index.position("label"), Some(1));
        assert_eq!(index.position("labels"), Some(1));
        assert_eq!(index.position("other"), None);
    }

    #[test]
    fn test_features_routed_by_name() {
        let dec = decoder(&[("a", "A"), ("b", "B")]);
        // written out of order, with an unknown feature in between
        let sample = vec![
            TensorRecord::from_i64("b", vec![1], &[2]),
            TensorRecord::from_i64("zzz", vec![1], &[9]),
            TensorRecord::from_i64("a", vec![1], &[1]),
        ];
        let ds = dec.decode(encode_shard(&[sample]).unwrap()).unwrap();

        assert_eq!(ds.num_samples(), 1);
        let s = ds.sample(0).unwrap();
        assert_eq!(s.feature(0).unwrap().to_i64().unwrap(), vec![1]);
        assert_eq!(s.feature(1).unwrap().to_i64().unwrap(), vec![2]);
    }

    #[test]
    fn test_empty_input_is_empty_data_set() {
        let dec = decoder(&[("a", "A")]);
        let ds = dec.decode(Bytes::new()).unwrap();
        assert!(ds.is_empty());
    }

    #[test]
    fn test_partial_length_prefix_is_truncated() {
        let dec = decoder(&[("a", "A")]);
        let err = dec.decode(Bytes::from_static(&[1, 0])).unwrap_err();
        assert!(matches!(err, LoaderError::Truncated { offset: 0, needed: 4, available: 2 }));
    }

    #[test]
    fn test_garbage_record_is_decode_error() {
        let dec = decoder(&[("a", "A")]);
        let mut raw = BytesMut::new();
        raw.put_u32_le(6);
        raw.put_u32_le(2);
        // field 1 declared length-delimited with an overlong length
        raw.extend_from_slice(&[0x0a, 0x7f]);
        let err = dec.decode(raw.freeze()).unwrap_err();
        assert!(matches!(err, LoaderError::Decode { offset: 8, .. }));
    }

    #[test]
    fn test_writer_matches_encoder() {
        let samples = vec![
            vec![TensorRecord::from_f32("a", vec![2], &[0.5, 1.5])],
            vec![TensorRecord::from_f32("a", vec![1], &[3.0])],
        ];
        let mut writer = ShardWriter::new(Vec::new());
        for s in &samples {
            writer.write_sample(s).unwrap();
        }
        assert_eq!(writer.samples_written(), 2);
        let written = writer.finish().unwrap();
        assert_eq!(written, encode_shard(&samples).unwrap().to_vec());
    }
}
