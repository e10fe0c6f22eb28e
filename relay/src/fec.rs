//! XOR-Parity Forward Error Correction
//!
//! A block is split into N data chunks and M parity chunks. Parity chunk `p`
//! is the XOR of the data chunks `{j : j mod M == p}`; both ends derive the
//! subsets from the geometry, so no subset list travels on the wire.
//!
//! Recovery is iterative single-unknown elimination: whenever a received
//! parity equation has exactly one missing data chunk, that chunk is the XOR
//! of the parity with the known members. Rounds repeat until nothing new is
//! recoverable.

use std::collections::HashMap;

/// Typical shard geometry: lose up to a third of the datagrams
pub const DEFAULT_DATA_CHUNKS: usize = 100;

/// Default parity count paired with [`DEFAULT_DATA_CHUNKS`]
pub const DEFAULT_PARITY_CHUNKS: usize = 50;

/// The data-chunk subset covered by one parity chunk.
pub fn parity_subset(parity_index: usize, parity_count: usize, data_chunks: usize) -> Vec<usize> {
    if parity_count == 0 {
        return Vec::new();
    }
    (0..data_chunks)
        .filter(|j| j % parity_count == parity_index)
        .collect()
}

/// Compute the parity chunks for a set of equal-length data chunks.
pub fn encode_parity(data: &[Vec<u8>], parity_count: usize) -> Vec<Vec<u8>> {
    let chunk_len = data.iter().map(Vec::len).max().unwrap_or(0);
    (0..parity_count)
        .map(|p| {
            let mut parity = vec![0u8; chunk_len];
            for &j in &parity_subset(p, parity_count, data.len()) {
                xor_into(&mut parity, &data[j]);
            }
            parity
        })
        .collect()
}

/// Per-block FEC state: received buffers plus the parity equations.
#[derive(Debug)]
pub struct FecDecoder {
    data_chunks: usize,
    total_chunks: usize,
    buffers: Vec<Option<Vec<u8>>>,
    subsets: HashMap<usize, Vec<usize>>,
}

impl FecDecoder {
    /// Create a decoder for the given geometry.
    pub fn new(data_chunks: usize, total_chunks: usize) -> Self {
        let parity_count = total_chunks.saturating_sub(data_chunks);
        let subsets = (0..parity_count)
            .map(|p| (data_chunks + p, parity_subset(p, parity_count, data_chunks)))
            .collect();

        FecDecoder {
            data_chunks,
            total_chunks,
            buffers: vec![None; total_chunks],
            subsets,
        }
    }

    /// Store a chunk. Returns false for out-of-range ids and duplicates.
    pub fn add_chunk(&mut self, chunk_id: usize, payload: Vec<u8>) -> bool {
        if chunk_id >= self.total_chunks || self.buffers[chunk_id].is_some() {
            return false;
        }
        self.buffers[chunk_id] = Some(payload);
        true
    }

    /// Number of data chunks present (received or recovered).
    pub fn data_present(&self) -> usize {
        self.buffers[..self.data_chunks]
            .iter()
            .filter(|b| b.is_some())
            .count()
    }

    /// Total chunks of any kind present.
    pub fn chunks_present(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    /// True once every data chunk is available.
    pub fn is_complete(&self) -> bool {
        self.data_present() == self.data_chunks
    }

    /// Run elimination rounds until complete or no parity equation has a
    /// single unknown left. Returns completeness.
    pub fn try_recover(&mut self) -> bool {
        loop {
            if self.is_complete() {
                return true;
            }

            let mut progressed = false;
            for (&parity_id, subset) in &self.subsets {
                let parity = match &self.buffers[parity_id] {
                    Some(p) => p,
                    None => continue,
                };

                let missing: Vec<usize> = subset
                    .iter()
                    .copied()
                    .filter(|&j| self.buffers[j].is_none())
                    .collect();
                if missing.len() != 1 {
                    continue;
                }

                let mut recovered = parity.clone();
                for &j in subset {
                    if j != missing[0] {
                        if let Some(known) = &self.buffers[j] {
                            xor_into(&mut recovered, known);
                        }
                    }
                }

                self.buffers[missing[0]] = Some(recovered);
                progressed = true;
                break;
            }

            if !progressed {
                return false;
            }
        }
    }

    /// Concatenate the data chunks. `None` until complete.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::new();
        for buffer in &self.buffers[..self.data_chunks] {
            out.extend_from_slice(buffer.as_ref().unwrap());
        }
        Some(out)
    }
}

fn xor_into(accumulator: &mut Vec<u8>, chunk: &[u8]) {
    if accumulator.len() < chunk.len() {
        accumulator.resize(chunk.len(), 0);
    }
    for (a, &b) in accumulator.iter_mut().zip(chunk.iter()) {
        *a ^= b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_data(n: usize, chunk_len: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| (0..chunk_len).map(|b| ((i * 31 + b * 7) & 0xff) as u8).collect())
            .collect()
    }

    #[test]
    fn test_subsets_partition_the_data() {
        let mut covered = vec![0usize; 10];
        for p in 0..4 {
            for j in parity_subset(p, 4, 10) {
                covered[j] += 1;
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn test_complete_without_parity() {
        let data = make_data(10, 16);
        let mut decoder = FecDecoder::new(10, 15);
        for (i, chunk) in data.iter().enumerate() {
            decoder.add_chunk(i, chunk.clone());
        }
        assert!(decoder.try_recover());
        assert_eq!(decoder.assemble().unwrap(), data.concat());
    }

    #[test]
    fn test_recovers_one_loss_per_group() {
        let data = make_data(10, 16);
        let parity = encode_parity(&data, 5);
        let mut decoder = FecDecoder::new(10, 15);

        // Lose data chunks 2 and 3 (different groups mod 5).
        for (i, chunk) in data.iter().enumerate() {
            if i != 2 && i != 3 {
                decoder.add_chunk(i, chunk.clone());
            }
        }
        for (p, chunk) in parity.iter().enumerate() {
            decoder.add_chunk(10 + p, chunk.clone());
        }

        assert!(decoder.try_recover());
        assert_eq!(decoder.assemble().unwrap(), data.concat());
    }

    #[test]
    fn test_any_n_of_n_plus_m_within_group_limits() {
        // 20% loss over a realistic geometry, one loss per parity group.
        let data = make_data(20, 32);
        let parity = encode_parity(&data, 10);
        let mut decoder = FecDecoder::new(20, 30);

        // Drop data chunks 0..4 and 15: chunks 0..4 fall in groups 0..4,
        // chunk 15 in group 5.
        let lost = [0usize, 1, 2, 3, 4, 15];
        for (i, chunk) in data.iter().enumerate() {
            if !lost.contains(&i) {
                decoder.add_chunk(i, chunk.clone());
            }
        }
        for (p, chunk) in parity.iter().enumerate() {
            decoder.add_chunk(20 + p, chunk.clone());
        }

        assert!(decoder.try_recover());
        assert_eq!(decoder.assemble().unwrap(), data.concat());
    }

    #[test]
    fn test_two_losses_in_one_group_stall() {
        let data = make_data(10, 8);
        let parity = encode_parity(&data, 5);
        let mut decoder = FecDecoder::new(10, 15);

        // Chunks 0 and 5 are both in group 0: unrecoverable.
        for (i, chunk) in data.iter().enumerate() {
            if i != 0 && i != 5 {
                decoder.add_chunk(i, chunk.clone());
            }
        }
        for (p, chunk) in parity.iter().enumerate() {
            decoder.add_chunk(10 + p, chunk.clone());
        }

        assert!(!decoder.try_recover());
        assert!(decoder.assemble().is_none());
    }

    #[test]
    fn test_duplicate_and_out_of_range_chunks_rejected() {
        let mut decoder = FecDecoder::new(2, 3);
        assert!(decoder.add_chunk(0, vec![1]));
        assert!(!decoder.add_chunk(0, vec![2]));
        assert!(!decoder.add_chunk(3, vec![3]));
    }
}
