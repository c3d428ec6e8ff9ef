pub const SEQUENCE_SPACE: usize = u16::MAX as usize + 1;
pub const BLOCK_COUNT: usize = 4;
pub const BLOCK_SIZE: usize = SEQUENCE_SPACE / BLOCK_COUNT;

const WORD_BITS: usize = u32::BITS as usize;
const WORDS_PER_BLOCK: usize = BLOCK_SIZE / WORD_BITS;
const HALF_SPACE: u16 = (SEQUENCE_SPACE / 2) as u16;

#[inline]
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= HALF_SPACE)) || ((s1 < s2) && (s2 - s1 > HALF_SPACE))
}

#[inline]
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    previous: usize,
    current: usize,
}

impl Window {
    fn starting_at(block: usize) -> Self {
        Self {
            previous: (block + BLOCK_COUNT - 1) % BLOCK_COUNT,
            current: block,
        }
    }

    fn contains(&self, block: usize) -> bool {
        block == self.previous || block == self.current
    }
}

/// Duplicate filter over the full 16-bit sequence space.
///
/// The space is split into [`BLOCK_COUNT`] blocks of which two are live. A
/// block's bits are cleared as it leaves the live window, so a sequence
/// accepted once is rejected until its block has rotated out and back in.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    words: Box<[u32]>,
    window: Option<Window>,
    newest: u16,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self {
            words: vec![0u32; SEQUENCE_SPACE / WORD_BITS].into_boxed_slice(),
            window: None,
            newest: 0,
        }
    }

    /// Records `sequence`, returning `false` if it was already recorded or
    /// falls behind the live window.
    pub fn accept(&mut self, sequence: u16) -> bool {
        let block = block_of(sequence);

        match self.window {
            None => {
                self.window = Some(Window::starting_at(block));
                self.newest = sequence;
            }
            Some(window) if window.contains(block) => {}
            Some(_) if sequence_greater_than(sequence, self.newest) => {
                for _ in 0..BLOCK_COUNT {
                    if self.window.is_some_and(|w| w.contains(block)) {
                        break;
                    }
                    self.rotate();
                }
            }
            Some(_) => return false,
        }

        let (word, mask) = slot(sequence);
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;

        if sequence_greater_than(sequence, self.newest) {
            self.newest = sequence;
        }
        true
    }

    pub fn is_accepted(&self, sequence: u16) -> bool {
        let Some(window) = self.window else {
            return false;
        };
        if !window.contains(block_of(sequence)) {
            return false;
        }
        let (word, mask) = slot(sequence);
        self.words[word] & mask != 0
    }

    /// Bit `i` is set when `sequence - (i + 1)` has been accepted.
    pub fn ack_bitfield(&self, sequence: u16) -> u32 {
        (0..u32::BITS).fold(0u32, |bits, i| {
            let earlier = sequence.wrapping_sub(i as u16 + 1);
            if self.is_accepted(earlier) {
                bits | (1 << i)
            } else {
                bits
            }
        })
    }

    pub fn newest(&self) -> Option<u16> {
        self.window.map(|_| self.newest)
    }

    pub fn reset(&mut self) {
        self.words.fill(0);
        self.window = None;
        self.newest = 0;
    }

    fn rotate(&mut self) {
        let Some(window) = self.window else {
            return;
        };
        let start = window.previous * WORDS_PER_BLOCK;
        self.words[start..start + WORDS_PER_BLOCK].fill(0);
        self.window = Some(Window {
            previous: window.current,
            current: (window.current + 1) % BLOCK_COUNT,
        });
    }
}

#[inline]
fn block_of(sequence: u16) -> usize {
    sequence as usize / BLOCK_SIZE
}

#[inline]
fn slot(sequence: u16) -> (usize, u32) {
    let index = sequence as usize;
    (index / WORD_BITS, 1 << (index % WORD_BITS))
}
