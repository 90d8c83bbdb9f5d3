use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Bytes drawn from the backing source per refill.
pub const REFILL_BATCH: usize = 65_536;

/// Supplier of raw random bytes behind [`RandomSource`].
pub trait ByteSource: Send {
    fn fill_bytes(&mut self, dest: &mut [u8]);
}

/// ChaCha stream, seeded either from OS entropy or from a fixed seed.
pub struct EntropyBytes {
    rng: ChaCha8Rng,
}

impl EntropyBytes {
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha8Rng::from_os_rng(),
        }
    }

    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl ByteSource for EntropyBytes {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}

/// Fixed byte sequence, repeated from the start once exhausted.
#[derive(Debug, Clone)]
pub struct ScriptedBytes {
    bytes: Vec<u8>,
    cursor: usize,
}

impl ScriptedBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, cursor: 0 }
    }
}

impl ByteSource for ScriptedBytes {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if self.bytes.is_empty() {
            dest.fill(0);
            return;
        }
        for slot in dest.iter_mut() {
            *slot = self.bytes[self.cursor];
            self.cursor = (self.cursor + 1) % self.bytes.len();
        }
    }
}

/// The single stream of randomness consumed by a run.
///
/// Each draw takes one byte from a buffer refilled in batches of
/// [`REFILL_BATCH`]. Every consumed byte is appended to the replay log, which
/// survives restarts so that feeding it to [`ScriptedBytes`] reproduces the
/// whole session.
pub struct RandomSource {
    source: Box<dyn ByteSource>,
    buffer: Vec<u8>,
    cursor: usize,
    replay_log: Vec<u8>,
}

impl RandomSource {
    pub fn new(source: Box<dyn ByteSource>) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            cursor: 0,
            replay_log: Vec::new(),
        }
    }

    pub fn from_seed(seed: u64) -> Self {
        Self::new(Box::new(EntropyBytes::from_seed(seed)))
    }

    pub fn from_entropy() -> Self {
        Self::new(Box::new(EntropyBytes::from_entropy()))
    }

    pub fn scripted(bytes: Vec<u8>) -> Self {
        Self::new(Box::new(ScriptedBytes::new(bytes)))
    }

    /// Uniform value in `[0, 1)` with 1/256 resolution.
    pub fn next(&mut self) -> f64 {
        f64::from(self.next_byte()) / 256.0
    }

    /// `floor(next() * n)`; always `< n` for `n > 0`.
    pub fn below(&mut self, n: usize) -> usize {
        debug_assert!(n > 0 && n <= 256, "draw range must fit one byte");
        (usize::from(self.next_byte()) * n) >> 8
    }

    pub fn replay_log(&self) -> &[u8] {
        &self.replay_log
    }

    pub fn consumed(&self) -> usize {
        self.replay_log.len()
    }

    /// Replaces the backing source and drops any buffered bytes. The replay
    /// log is kept.
    pub fn reseed(&mut self, source: Box<dyn ByteSource>) {
        self.source = source;
        self.buffer.clear();
        self.cursor = 0;
    }

    fn next_byte(&mut self) -> u8 {
        if self.cursor >= self.buffer.len() {
            self.refill();
        }
        let byte = self.buffer[self.cursor];
        self.cursor += 1;
        self.replay_log.push(byte);
        byte
    }

    fn refill(&mut self) {
        self.buffer.resize(REFILL_BATCH, 0);
        self.source.fill_bytes(&mut self.buffer);
        self.cursor = 0;
    }
}

/// Byte that makes [`RandomSource::below`]`(n)` return `index`.
pub fn byte_for_draw(index: usize, n: usize) -> u8 {
    debug_assert!(index < n && n <= 256);
    ((index * 256).div_ceil(n)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_are_byte_over_256() {
        let mut random = RandomSource::scripted(vec![0, 128, 255]);
        assert_eq!(random.next(), 0.0);
        assert_eq!(random.next(), 0.5);
        assert_eq!(random.next(), 255.0 / 256.0);
        assert_eq!(random.replay_log(), &[0, 128, 255]);
    }

    #[test]
    fn refill_is_transparent_across_batch_boundary() {
        let mut random = RandomSource::from_seed(7);
        for _ in 0..(REFILL_BATCH + 10) {
            let value = random.next();
            assert!((0.0..1.0).contains(&value));
        }
        assert_eq!(random.consumed(), REFILL_BATCH + 10);
    }

    #[test]
    fn replay_log_reproduces_seeded_stream() {
        let mut original = RandomSource::from_seed(99);
        let drawn: Vec<usize> = (0..500).map(|_| original.below(9)).collect();

        let mut replay = RandomSource::scripted(original.replay_log().to_vec());
        let replayed: Vec<usize> = (0..500).map(|_| replay.below(9)).collect();
        assert_eq!(drawn, replayed);
    }

    #[test]
    fn byte_for_draw_hits_every_bucket() {
        for n in [1_usize, 2, 3, 4, 9, 17] {
            for index in 0..n {
                let mut random = RandomSource::scripted(vec![byte_for_draw(index, n)]);
                assert_eq!(random.below(n), index, "n={n} index={index}");
            }
        }
    }

    #[test]
    fn reseed_keeps_log() {
        let mut random = RandomSource::scripted(vec![1, 2, 3]);
        random.next();
        random.reseed(Box::new(ScriptedBytes::new(vec![9])));
        random.next();
        assert_eq!(random.replay_log(), &[1, 9]);
    }
}
