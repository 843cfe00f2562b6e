use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::config::Config;
use crate::io as file_io;

/// One aligned pair of token id sequences. Target sequences are expected to
/// carry their begin/end markers already.
#[derive(Debug, Clone, Deserialize)]
pub struct PairRecord {
    pub source: Vec<u32>,
    pub target: Vec<u32>,
}

pub struct PairDataset {
    pairs: Vec<PairRecord>,
    src_max_len: usize,
    trg_max_len: usize,
    pad_id: u32,
}

impl PairDataset {
    pub fn new(pairs: Vec<PairRecord>, src_max_len: usize, trg_max_len: usize, pad_id: u32) -> Self {
        Self {
            pairs,
            src_max_len,
            trg_max_len,
            pad_id,
        }
    }

    fn from_reader<R: Read>(reader: R) -> Result<Vec<PairRecord>> {
        let reader = BufReader::new(reader);
        let mut pairs = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let record: PairRecord = serde_json::from_str(&line)?;
            if !record.source.is_empty() && !record.target.is_empty() {
                pairs.push(record);
            }
        }

        Ok(pairs)
    }

    /// Load pairs from a JSONL file where each line has "source" and "target"
    /// token id arrays. Supports .gz and .zst/.zstd compressed files.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        src_max_len: usize,
        trg_max_len: usize,
        pad_id: u32,
    ) -> Result<Self> {
        let reader = file_io::open_file(path)?;
        let pairs = Self::from_reader(reader)?;
        Ok(Self::new(pairs, src_max_len, trg_max_len, pad_id))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn pad_to(&self, ids: &[u32], len: usize) -> Vec<u32> {
        let mut padded = ids.to_vec();
        padded.truncate(len);
        padded.resize(len, self.pad_id);
        padded
    }

    /// Batch the selected pairs as `(source, target)` id tensors of shape
    /// `(batch, src_max_len)` and `(batch, trg_max_len)`.
    pub fn get_batch(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let batch_size = indices.len();
        let mut src_data = Vec::with_capacity(batch_size * self.src_max_len);
        let mut trg_data = Vec::with_capacity(batch_size * self.trg_max_len);

        for &idx in indices {
            let pair = &self.pairs[idx];
            src_data.extend(self.pad_to(&pair.source, self.src_max_len));
            trg_data.extend(self.pad_to(&pair.target, self.trg_max_len));
        }

        let src = Tensor::new(src_data, device)?
            .reshape((batch_size, self.src_max_len))?
            .to_dtype(candle_core::DType::U32)?;
        let trg = Tensor::new(trg_data, device)?
            .reshape((batch_size, self.trg_max_len))?
            .to_dtype(candle_core::DType::U32)?;

        Ok((src, trg))
    }

    /// Shuffle and carve off a validation split. The ratio is clamped to
    /// `[0, 1]`.
    pub fn split(mut self, valid_ratio: f64) -> (Self, Self) {
        let mut rng = rand::rng();
        self.pairs.shuffle(&mut rng);

        let valid_len = (self.pairs.len() as f64 * valid_ratio.clamp(0.0, 1.0)) as usize;
        let valid_pairs = self.pairs.split_off(self.pairs.len() - valid_len);
        let valid = Self::new(valid_pairs, self.src_max_len, self.trg_max_len, self.pad_id);
        (self, valid)
    }

    pub fn pairs(&self) -> &[PairRecord] {
        &self.pairs
    }
}

pub struct DataLoader {
    dataset: PairDataset,
    batch_size: usize,
    shuffle: bool,
    indices: Vec<usize>,
    current_pos: usize,
}

impl DataLoader {
    pub fn new(dataset: PairDataset, batch_size: usize, shuffle: bool) -> Self {
        let len = dataset.len();
        let indices: Vec<usize> = (0..len).collect();
        Self {
            dataset,
            batch_size,
            shuffle,
            indices,
            current_pos: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current_pos = 0;
        if self.shuffle {
            let mut rng = rand::rng();
            self.indices.shuffle(&mut rng);
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    pub fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        if self.current_pos + self.batch_size > self.indices.len() {
            return Ok(None);
        }

        let batch_indices: Vec<usize> =
            self.indices[self.current_pos..self.current_pos + self.batch_size].to_vec();
        self.current_pos += self.batch_size;

        let (src, trg) = self.dataset.get_batch(&batch_indices, device)?;
        Ok(Some((src, trg)))
    }

    pub fn iter<'a>(&'a mut self, device: &'a Device) -> DataLoaderIterator<'a> {
        self.reset();
        DataLoaderIterator {
            loader: self,
            device,
        }
    }
}

pub struct DataLoaderIterator<'a> {
    loader: &'a mut DataLoader,
    device: &'a Device,
}

impl<'a> Iterator for DataLoaderIterator<'a> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.loader.next_batch(self.device) {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Synthetic pairs for smoke runs: uniform source ids plus targets wrapped in
/// the begin/end markers from `config`.
pub fn generate_random_pairs(num_pairs: usize, config: &Config) -> PairDataset {
    let mut rng = rand::rng();
    let mut pairs = Vec::with_capacity(num_pairs);

    for _ in 0..num_pairs {
        let src_len = rng.random_range(4..=config.src_max_len);
        let trg_len = rng.random_range(4..=config.trg_max_len.saturating_sub(2));
        let source: Vec<u32> = (0..src_len)
            .map(|_| rng.random_range(3..config.vocab_size as u32))
            .collect();
        let mut target = Vec::with_capacity(trg_len + 2);
        target.push(config.bos_id);
        target.extend((0..trg_len).map(|_| rng.random_range(3..config.vocab_size as u32)));
        target.push(config.eos_id);
        pairs.push(PairRecord { source, target });
    }

    PairDataset::new(pairs, config.src_max_len, config.trg_max_len, config.pad_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_jsonl(lines: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.jsonl");
        std::fs::write(&path, lines.join("\n")).unwrap();
        (dir, path)
    }

    #[test]
    fn test_from_file_skips_empty_records() {
        let (_dir, path) = write_jsonl(&[
            r#"{"source": [5, 6, 7], "target": [1, 8, 9, 2]}"#,
            "",
            r#"{"source": [], "target": [1, 2]}"#,
            r#"{"source": [10], "target": [1, 11, 2]}"#,
        ]);

        let dataset = PairDataset::from_file(&path, 8, 8, 0).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.pairs()[0].source, vec![5, 6, 7]);
        assert_eq!(dataset.pairs()[1].target, vec![1, 11, 2]);
    }

    #[test]
    fn test_batch_pads_and_truncates() {
        let pairs = vec![
            PairRecord {
                source: vec![5, 6],
                target: vec![1, 7, 2],
            },
            PairRecord {
                source: vec![8, 9, 10, 11, 12, 13],
                target: vec![1, 2],
            },
        ];
        let dataset = PairDataset::new(pairs, 4, 4, 0);

        let (src, trg) = dataset.get_batch(&[0, 1], &Device::Cpu).unwrap();
        assert_eq!(src.dims(), &[2, 4]);
        assert_eq!(trg.dims(), &[2, 4]);

        let src_rows = src.to_vec2::<u32>().unwrap();
        assert_eq!(src_rows[0], vec![5, 6, 0, 0]);
        assert_eq!(src_rows[1], vec![8, 9, 10, 11]);

        let trg_rows = trg.to_vec2::<u32>().unwrap();
        assert_eq!(trg_rows[0], vec![1, 7, 2, 0]);
        assert_eq!(trg_rows[1], vec![1, 2, 0, 0]);
    }

    #[test]
    fn test_loader_yields_full_batches_only() {
        let config = Config::tiny();
        let dataset = generate_random_pairs(10, &config);
        let mut loader = DataLoader::new(dataset, 3, false);

        assert_eq!(loader.num_batches(), 3);

        let device = Device::Cpu;
        let mut seen = 0;
        for batch in loader.iter(&device) {
            let (src, trg) = batch.unwrap();
            assert_eq!(src.dims()[0], 3);
            assert_eq!(trg.dims()[0], 3);
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_split_ratio() {
        let config = Config::tiny();
        let dataset = generate_random_pairs(100, &config);
        let (train, valid) = dataset.split(0.2);
        assert_eq!(train.len(), 80);
        assert_eq!(valid.len(), 20);
    }

    #[test]
    fn test_split_ratio_out_of_range_is_clamped() {
        let config = Config::tiny();
        let dataset = generate_random_pairs(10, &config);
        let (train, valid) = dataset.split(1.5);
        assert_eq!(train.len(), 0);
        assert_eq!(valid.len(), 10);

        let dataset = generate_random_pairs(10, &config);
        let (train, valid) = dataset.split(-0.5);
        assert_eq!(train.len(), 10);
        assert_eq!(valid.len(), 0);
    }

    #[test]
    fn test_generate_random_pairs_wraps_targets() {
        let config = Config::tiny();
        let dataset = generate_random_pairs(16, &config);
        assert_eq!(dataset.len(), 16);

        for pair in dataset.pairs() {
            assert_eq!(pair.target[0], config.bos_id);
            assert_eq!(*pair.target.last().unwrap(), config.eos_id);
            assert!(pair.source.iter().all(|&id| id < config.vocab_size as u32));
            assert!(pair.source.len() <= config.src_max_len);
            assert!(pair.target.len() <= config.trg_max_len);
        }
    }
}
