// Design notes:
//
// The hasher keeps chaining values for completed subtrees on a stack without
// storing their sizes. Every subtree pushed during update is a power of two
// chunks, so adding a subtree on the right is like adding a 1 to a binary
// counter of chunks, and merging two subtrees is like propagating a carry. The
// number of entries left after all carries is the popcount of the chunk
// counter.
//
// Merging is lazy: we only merge when we know more input is coming, because
// the rightmost node must not be compressed until we know whether it's the
// root. The root flag is applied only when output bytes are produced, never
// while the tree is being built.
//
// Output nodes are plain values. Computing a chaining value or root bytes from
// one never changes it, so finalization can be repeated, and root output can
// be read from any position.

use arrayref::{array_mut_ref, array_ref};
use arrayvec::{ArrayString, ArrayVec};
use core::cmp;
use core::convert::TryInto;
use core::fmt;
use platform::{Platform, MAX_SIMD_DEGREE_OR_2};
use std::io;

mod error;
mod platform;
mod portable;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod sse41;

pub mod copy;

#[cfg(test)]
mod test;

pub use error::Error;

/// The number of bytes in a [`Hash`](struct.Hash.html), 32.
pub const OUT_LEN: usize = 32;

/// The number of bytes in a key, 32.
pub const KEY_LEN: usize = 32;

/// The maximum depth of the tree. 2^54 chunks of 1024 bytes is 2^64 bytes.
pub const MAX_DEPTH: usize = 54;

// These are pub for tests and benchmarks. Callers don't need them.
#[doc(hidden)]
pub const BLOCK_LEN: usize = 64;
#[doc(hidden)]
pub const CHUNK_LEN: usize = 1024;
#[doc(hidden)]
pub use platform::MAX_SIMD_DEGREE;

type CVWords = [u32; 8];
type CVBytes = [u8; 32];

const IV: &CVWords = &[
    0x6A09E667, 0xBB67AE85, 0x3C6EF372, 0xA54FF53A, 0x510E527F, 0x9B05688C, 0x1F83D9AB, 0x5BE0CD19,
];

const MSG_SCHEDULE: [[usize; 16]; 7] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    [2, 6, 3, 10, 7, 0, 4, 13, 1, 11, 12, 5, 9, 14, 15, 8],
    [3, 4, 10, 12, 13, 2, 7, 14, 6, 5, 9, 0, 11, 15, 8, 1],
    [10, 7, 12, 9, 14, 3, 13, 15, 4, 0, 11, 2, 5, 8, 1, 6],
    [12, 13, 9, 11, 15, 10, 14, 8, 7, 2, 5, 3, 0, 1, 6, 4],
    [9, 14, 11, 5, 8, 12, 15, 1, 13, 3, 0, 10, 2, 6, 4, 7],
    [11, 15, 5, 0, 1, 9, 8, 6, 14, 10, 2, 12, 3, 4, 7, 13],
];

bitflags::bitflags! {
    struct Flags: u8 {
        const CHUNK_START = 1 << 0;
        const CHUNK_END = 1 << 1;
        const PARENT = 1 << 2;
        const ROOT = 1 << 3;
        const KEYED_HASH = 1 << 4;
        const DERIVE_KEY_CONTEXT = 1 << 5;
        const DERIVE_KEY_MATERIAL = 1 << 6;
    }
}

#[inline]
fn counter_low(counter: u64) -> u32 {
    counter as u32
}

#[inline]
fn counter_high(counter: u64) -> u32 {
    (counter >> 32) as u32
}

// Chunks are hashed with consecutive counters. Parents all use zero.
#[derive(Clone, Copy, Debug)]
enum IncrementCounter {
    Yes,
    No,
}

impl IncrementCounter {
    #[inline]
    fn yes(&self) -> bool {
        match self {
            IncrementCounter::Yes => true,
            IncrementCounter::No => false,
        }
    }
}

/// A BLAKE3 output of the default size, 32 bytes.
///
/// `PartialEq` is constant-time, so comparing a `Hash` against an expected
/// MAC doesn't leak timing information.
#[derive(Clone, Copy)]
pub struct Hash([u8; OUT_LEN]);

impl Hash {
    pub fn as_bytes(&self) -> &[u8; OUT_LEN] {
        &self.0
    }

    /// Lowercase hex, without allocating.
    pub fn to_hex(&self) -> ArrayString<[u8; 2 * OUT_LEN]> {
        let mut s = ArrayString::new();
        let table = b"0123456789abcdef";
        for &b in self.0.iter() {
            s.push(table[(b >> 4) as usize] as char);
            s.push(table[(b & 0xf) as usize] as char);
        }
        s
    }
}

impl From<[u8; OUT_LEN]> for Hash {
    fn from(bytes: [u8; OUT_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Hash> for [u8; OUT_LEN] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

impl PartialEq for Hash {
    fn eq(&self, other: &Hash) -> bool {
        constant_time_eq::constant_time_eq(&self.0[..], &other.0[..])
    }
}

impl PartialEq<[u8; OUT_LEN]> for Hash {
    fn eq(&self, other: &[u8; OUT_LEN]) -> bool {
        constant_time_eq::constant_time_eq(&self.0[..], other)
    }
}

impl Eq for Hash {}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hash(0x{})", self.to_hex())
    }
}

// Each chunk or parent node can produce either a 32-byte chaining value or, by
// setting the ROOT flag, any number of final output bytes. The Output struct
// captures the state just prior to choosing between those two possibilities.
#[derive(Clone)]
struct Output {
    input_chaining_value: CVWords,
    block: [u8; BLOCK_LEN],
    block_len: u8,
    counter: u64,
    flags: u8,
    platform: Platform,
}

impl Output {
    fn chaining_value(&self) -> CVBytes {
        let mut cv = self.input_chaining_value;
        self.platform.compress_in_place(
            &mut cv,
            &self.block,
            self.block_len,
            self.counter,
            self.flags,
        );
        platform::le_bytes_from_words_32(&cv)
    }

    fn root_hash(&self) -> Hash {
        debug_assert_eq!(self.counter, 0);
        let mut cv = self.input_chaining_value;
        self.platform.compress_in_place(
            &mut cv,
            &self.block,
            self.block_len,
            0,
            self.flags | Flags::ROOT.bits(),
        );
        Hash(platform::le_bytes_from_words_32(&cv))
    }

    // The caller must keep seek + out.len() below 2^64.
    fn root_output_bytes(&self, seek: u64, mut out: &mut [u8]) {
        let mut output_block_counter = seek / BLOCK_LEN as u64;
        let mut offset_within_block = (seek % BLOCK_LEN as u64) as usize;
        while !out.is_empty() {
            let output_block = self.platform.compress_xof(
                &self.input_chaining_value,
                &self.block,
                self.block_len,
                output_block_counter,
                self.flags | Flags::ROOT.bits(),
            );
            let take = cmp::min(BLOCK_LEN - offset_within_block, out.len());
            out[..take].copy_from_slice(&output_block[offset_within_block..][..take]);
            out = &mut out[take..];
            offset_within_block = 0;
            output_block_counter += 1;
        }
    }
}

#[derive(Clone)]
struct ChunkState {
    cv: CVWords,
    chunk_counter: u64,
    buf: [u8; BLOCK_LEN],
    buf_len: u8,
    blocks_compressed: u8,
    flags: u8,
    platform: Platform,
}

impl ChunkState {
    fn new(key: &CVWords, chunk_counter: u64, flags: u8, platform: Platform) -> Self {
        Self {
            cv: *key,
            chunk_counter,
            buf: [0; BLOCK_LEN],
            buf_len: 0,
            blocks_compressed: 0,
            flags,
            platform,
        }
    }

    // The length of the current chunk, including buffered bytes.
    fn len(&self) -> usize {
        BLOCK_LEN * self.blocks_compressed as usize + self.buf_len as usize
    }

    fn fill_buf(&mut self, input: &mut &[u8]) {
        let want = BLOCK_LEN - self.buf_len as usize;
        let take = cmp::min(want, input.len());
        self.buf[self.buf_len as usize..][..take].copy_from_slice(&input[..take]);
        self.buf_len += take as u8;
        *input = &input[take..];
    }

    fn start_flag(&self) -> u8 {
        if self.blocks_compressed == 0 {
            Flags::CHUNK_START.bits()
        } else {
            0
        }
    }

    // Try to avoid buffering as much as possible, by compressing directly from
    // the input slice when full blocks are available. The last block of the
    // chunk always stays in the buffer, because it needs CHUNK_END.
    fn update(&mut self, mut input: &[u8]) -> &mut Self {
        if self.buf_len > 0 {
            self.fill_buf(&mut input);
            if !input.is_empty() {
                debug_assert_eq!(self.buf_len as usize, BLOCK_LEN);
                let block_flags = self.flags | self.start_flag();
                self.platform.compress_in_place(
                    &mut self.cv,
                    &self.buf,
                    BLOCK_LEN as u8,
                    self.chunk_counter,
                    block_flags,
                );
                self.buf_len = 0;
                self.buf = [0; BLOCK_LEN];
                self.blocks_compressed += 1;
            }
        }

        while input.len() > BLOCK_LEN {
            debug_assert_eq!(self.buf_len, 0);
            let block_flags = self.flags | self.start_flag();
            self.platform.compress_in_place(
                &mut self.cv,
                array_ref!(input, 0, BLOCK_LEN),
                BLOCK_LEN as u8,
                self.chunk_counter,
                block_flags,
            );
            self.blocks_compressed += 1;
            input = &input[BLOCK_LEN..];
        }

        self.fill_buf(&mut input);
        debug_assert!(input.is_empty());
        debug_assert!(self.len() <= CHUNK_LEN);
        self
    }

    fn output(&self) -> Output {
        let block_flags = self.flags | self.start_flag() | Flags::CHUNK_END.bits();
        Output {
            input_chaining_value: self.cv,
            block: self.buf,
            block_len: self.buf_len,
            counter: self.chunk_counter,
            flags: block_flags,
            platform: self.platform,
        }
    }
}

// Don't derive(Debug), because the state may be secret.
impl fmt::Debug for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChunkState")
            .field("len", &self.len())
            .field("chunk_counter", &self.chunk_counter)
            .field("flags", &self.flags)
            .field("platform", &self.platform)
            .finish()
    }
}

// Parents are never compressed with a counter, and the caller decides later
// whether the node is the root.
fn parent_node_output(
    left_child: &CVBytes,
    right_child: &CVBytes,
    key: &CVWords,
    flags: u8,
    platform: Platform,
) -> Output {
    let mut block = [0; BLOCK_LEN];
    block[..OUT_LEN].copy_from_slice(left_child);
    block[OUT_LEN..].copy_from_slice(right_child);
    Output {
        input_chaining_value: *key,
        block,
        block_len: BLOCK_LEN as u8,
        counter: 0,
        flags: flags | Flags::PARENT.bits(),
        platform,
    }
}

// =======================================================================
// ====================== Wide subtree compression =======================
// =======================================================================

// Hash up to MAX_SIMD_DEGREE chunks in one hash_many call, plus a trailing
// partial chunk if any. Writes one CV per chunk and returns how many. Never
// called for the root or for empty input.
fn compress_chunks_parallel(
    input: &[u8],
    key: &CVWords,
    chunk_counter: u64,
    flags: u8,
    platform: Platform,
    out: &mut [u8],
) -> usize {
    debug_assert!(!input.is_empty(), "empty chunks below the root");
    debug_assert!(input.len() <= MAX_SIMD_DEGREE * CHUNK_LEN);

    let mut chunks_exact = input.chunks_exact(CHUNK_LEN);
    let mut chunks_array = ArrayVec::<[&[u8; CHUNK_LEN]; MAX_SIMD_DEGREE]>::new();
    for chunk in &mut chunks_exact {
        chunks_array.push(array_ref!(chunk, 0, CHUNK_LEN));
    }
    platform.hash_many(
        &chunks_array,
        key,
        chunk_counter,
        IncrementCounter::Yes,
        flags,
        Flags::CHUNK_START.bits(),
        Flags::CHUNK_END.bits(),
        out,
    );

    // The partial chunk, if any.
    let chunks_so_far = chunks_array.len();
    if !chunks_exact.remainder().is_empty() {
        let counter = chunk_counter + chunks_so_far as u64;
        let mut chunk_state = ChunkState::new(key, counter, flags, platform);
        chunk_state.update(chunks_exact.remainder());
        *array_mut_ref!(out, chunks_so_far * OUT_LEN, OUT_LEN) =
            chunk_state.output().chaining_value();
        chunks_so_far + 1
    } else {
        chunks_so_far
    }
}

// Compress pairs of child CVs into parent CVs, up to MAX_SIMD_DEGREE_OR_2 at
// a time. An odd child left over is copied through as an extra output. Never
// called for the root.
fn compress_parents_parallel(
    child_chaining_values: &[u8],
    key: &CVWords,
    flags: u8,
    platform: Platform,
    out: &mut [u8],
) -> usize {
    debug_assert_eq!(child_chaining_values.len() % OUT_LEN, 0, "wacky hash bytes");
    let num_children = child_chaining_values.len() / OUT_LEN;
    debug_assert!(num_children >= 2, "not enough children");
    debug_assert!(num_children <= 2 * MAX_SIMD_DEGREE_OR_2, "too many");

    let mut parents_exact = child_chaining_values.chunks_exact(BLOCK_LEN);
    let mut parents_array = ArrayVec::<[&[u8; BLOCK_LEN]; MAX_SIMD_DEGREE_OR_2]>::new();
    for parent in &mut parents_exact {
        parents_array.push(array_ref!(parent, 0, BLOCK_LEN));
    }
    platform.hash_many(
        &parents_array,
        key,
        0, // Parents always use counter 0.
        IncrementCounter::No,
        flags | Flags::PARENT.bits(),
        0, // Parents have no start flags.
        0, // Parents have no end flags.
        out,
    );

    // If there's an odd child left over, it becomes an output.
    let parents_so_far = parents_array.len();
    if !parents_exact.remainder().is_empty() {
        out[parents_so_far * OUT_LEN..][..OUT_LEN].copy_from_slice(parents_exact.remainder());
        parents_so_far + 1
    } else {
        parents_so_far
    }
}

// Reduce a subtree to a row of CVs as wide as the SIMD degree (fewer if the
// input is short), so that parents can be hashed in parallel on the way up.
// For inputs longer than one chunk this always returns at least 2 CVs, even
// with degree 1, so the root is never compressed here.
fn compress_subtree_wide(
    input: &[u8],
    key: &CVWords,
    chunk_counter: u64,
    flags: u8,
    platform: Platform,
    out: &mut [u8],
) -> usize {
    if input.len() <= platform.simd_degree() * CHUNK_LEN {
        return compress_chunks_parallel(input, key, chunk_counter, flags, platform, out);
    }

    // Recurse on the largest complete left subtree and whatever remains.
    debug_assert_eq!(platform.simd_degree().count_ones(), 1, "power of 2");
    let (left, right) = input.split_at(left_len(input.len()));
    let right_chunk_counter = chunk_counter + (left.len() / CHUNK_LEN) as u64;

    let mut cv_array = [0; 2 * MAX_SIMD_DEGREE_OR_2 * OUT_LEN];
    let degree = if left.len() == CHUNK_LEN {
        // Degree 1, at the leaves.
        debug_assert_eq!(platform.simd_degree(), 1);
        1
    } else {
        cmp::max(platform.simd_degree(), 2)
    };
    let (left_out, right_out) = cv_array.split_at_mut(degree * OUT_LEN);

    let left_n = compress_subtree_wide(left, key, chunk_counter, flags, platform, left_out);
    let right_n = compress_subtree_wide(
        right,
        key,
        right_chunk_counter,
        flags,
        platform,
        right_out,
    );

    // Degree 1: return the pair uncompressed, it might be the root.
    debug_assert_eq!(left_n, degree);
    debug_assert!(right_n >= 1 && right_n <= left_n);
    if left_n == 1 {
        out[..2 * OUT_LEN].copy_from_slice(&cv_array[..2 * OUT_LEN]);
        return 2;
    }

    // Otherwise, do one layer of parent node compression.
    let num_children = left_n + right_n;
    compress_parents_parallel(
        &cv_array[..num_children * OUT_LEN],
        key,
        flags,
        platform,
        out,
    )
}

// Condense a subtree down to the two CVs of its top parent node, without
// compressing that node. It may be the root, if this is the first write or a
// one-shot hash.
fn compress_subtree_to_parent_node(
    input: &[u8],
    key: &CVWords,
    chunk_counter: u64,
    flags: u8,
    platform: Platform,
) -> [u8; BLOCK_LEN] {
    debug_assert!(input.len() > CHUNK_LEN);
    let mut cv_array = [0; MAX_SIMD_DEGREE_OR_2 * OUT_LEN];
    let mut num_cvs =
        compress_subtree_wide(input, key, chunk_counter, flags, platform, &mut cv_array);
    debug_assert!(num_cvs >= 2);

    let mut out_array = [0; MAX_SIMD_DEGREE_OR_2 * OUT_LEN / 2];
    while num_cvs > 2 {
        let cv_slice = &cv_array[..num_cvs * OUT_LEN];
        num_cvs = compress_parents_parallel(cv_slice, key, flags, platform, &mut out_array);
        cv_array[..num_cvs * OUT_LEN].copy_from_slice(&out_array[..num_cvs * OUT_LEN]);
    }
    *array_ref!(cv_array, 0, 2 * OUT_LEN)
}

// Largest power of two <= n, for n > 0.
fn largest_power_of_two_leq(n: usize) -> usize {
    ((n / 2) + 1).next_power_of_two()
}

// Given some input larger than one chunk, find the largest full tree of chunks
// that can go on the left.
fn left_len(content_len: usize) -> usize {
    debug_assert!(content_len > CHUNK_LEN);
    // Subtract 1 to reserve at least one byte for the right side.
    let full_chunks = (content_len - 1) / CHUNK_LEN;
    largest_power_of_two_leq(full_chunks) * CHUNK_LEN
}

// Hash a complete input all at once. Unlike compress_subtree_wide() and
// compress_subtree_to_parent_node(), this function handles the 1 chunk case.
fn hash_all_at_once(input: &[u8], key: &CVWords, flags: u8) -> Output {
    let platform = Platform::detect();

    if input.len() <= CHUNK_LEN {
        return ChunkState::new(key, 0, flags, platform)
            .update(input)
            .output();
    }

    Output {
        input_chaining_value: *key,
        block: compress_subtree_to_parent_node(input, key, 0, flags, platform),
        block_len: BLOCK_LEN as u8,
        counter: 0,
        flags: flags | Flags::PARENT.bits(),
        platform,
    }
}

/// The default hash function.
///
/// For an incremental version that accepts multiple writes, see
/// [`Hasher::update`](struct.Hasher.html#method.update).
pub fn hash(input: &[u8]) -> Hash {
    hash_all_at_once(input, IV, 0).root_hash()
}

/// The keyed hash function.
///
/// This is suitable for use as a message authentication code, for example to
/// replace an HMAC instance. In that use case, the constant-time equality
/// checking provided by [`Hash`](struct.Hash.html) is almost always a security
/// requirement, and callers need to be careful not to compare MACs as raw
/// bytes.
pub fn keyed_hash(key: &[u8; KEY_LEN], input: &[u8]) -> Hash {
    let key_words = platform::words_from_le_bytes_32(key);
    hash_all_at_once(input, &key_words, Flags::KEYED_HASH.bits()).root_hash()
}

/// The key derivation function.
///
/// Given cryptographic key material of any length and a context string of any
/// length, this function outputs a derived subkey of any length. The context
/// should be hardcoded and globally unique to the application. A good
/// default format is `"[application] [commit timestamp] [purpose]"`.
///
/// For output sizes other than 32 bytes, see
/// [`Hasher::new_derive_key`](struct.Hasher.html#method.new_derive_key) and
/// [`Hasher::finalize_xof`](struct.Hasher.html#method.finalize_xof).
pub fn derive_key(context: &[u8], key_material: &[u8]) -> [u8; OUT_LEN] {
    let context_key = hash_all_at_once(context, IV, Flags::DERIVE_KEY_CONTEXT.bits()).root_hash();
    let context_key_words = platform::words_from_le_bytes_32(context_key.as_bytes());
    hash_all_at_once(
        key_material,
        &context_key_words,
        Flags::DERIVE_KEY_MATERIAL.bits(),
    )
    .root_hash()
    .into()
}

fn mode_name(flags: u8) -> &'static str {
    if flags & Flags::KEYED_HASH.bits() != 0 {
        "keyed_hash"
    } else if flags & Flags::DERIVE_KEY_MATERIAL.bits() != 0 {
        "derive_key"
    } else {
        "hash"
    }
}

/// An incremental hash state that can accept any number of writes.
///
/// In addition to its inherent methods, this type implements
/// `std::io::Write`, so it can be used with
/// [`copy::copy_wide`](copy/fn.copy_wide.html) and `std::io::copy`.
///
/// Finalization never consumes or modifies the hasher. It's fine to finalize,
/// keep updating, and finalize again.
///
/// # Example
///
/// ```
/// let mut hasher = b3hash::Hasher::new();
/// hasher.update(b"foo");
/// hasher.update(b"bar");
/// assert_eq!(hasher.finalize(), b3hash::hash(b"foobar"));
///
/// let mut output = [0; 1000];
/// hasher.finalize_xof().fill(&mut output);
/// assert_eq!(&output[..32], b3hash::hash(b"foobar").as_bytes());
/// ```
#[derive(Clone)]
pub struct Hasher {
    key: CVWords,
    chunk_state: ChunkState,
    // MAX_DEPTH + 1 because of lazy merging: after 8 chunks the stack can hold
    // 4 entries, since we don't know yet whether more input is coming.
    cv_stack: ArrayVec<[CVBytes; MAX_DEPTH + 1]>,
}

impl Hasher {
    fn new_internal(key: &CVWords, flags: u8) -> Self {
        let platform = Platform::detect();
        tracing::trace!(mode = mode_name(flags), backend = platform.name(), "new hasher");
        Self {
            key: *key,
            chunk_state: ChunkState::new(key, 0, flags, platform),
            cv_stack: ArrayVec::new(),
        }
    }

    /// Construct a new `Hasher` for the regular hash function.
    pub fn new() -> Self {
        Self::new_internal(IV, 0)
    }

    /// Construct a new `Hasher` for the keyed hash function. See
    /// [`keyed_hash`](fn.keyed_hash.html).
    pub fn new_keyed(key: &[u8; KEY_LEN]) -> Self {
        let key_words = platform::words_from_le_bytes_32(key);
        Self::new_internal(&key_words, Flags::KEYED_HASH.bits())
    }

    /// Like [`new_keyed`](#method.new_keyed), but for key material whose
    /// length is only known at runtime. Fails unless the key is exactly
    /// `KEY_LEN` bytes.
    pub fn try_new_keyed(key: &[u8]) -> Result<Self, Error> {
        let key: &[u8; KEY_LEN] = key.try_into().map_err(|_| Error::InvalidKeyLength {
            expected: KEY_LEN,
            actual: key.len(),
        })?;
        Ok(Self::new_keyed(key))
    }

    /// Construct a new `Hasher` for the key derivation function. See
    /// [`derive_key`](fn.derive_key.html). The context string should be
    /// hardcoded and globally unique to the application.
    pub fn new_derive_key(context: &[u8]) -> Self {
        let context_key =
            hash_all_at_once(context, IV, Flags::DERIVE_KEY_CONTEXT.bits()).root_hash();
        let context_key_words = platform::words_from_le_bytes_32(context_key.as_bytes());
        Self::new_internal(&context_key_words, Flags::DERIVE_KEY_MATERIAL.bits())
    }

    /// Reset the `Hasher` to its initial state. The key and mode are kept.
    ///
    /// This is functionally the same as overwriting the `Hasher` with a new
    /// one, using the same key or context string if any.
    pub fn reset(&mut self) -> &mut Self {
        self.chunk_state = ChunkState::new(
            &self.key,
            0,
            self.chunk_state.flags,
            self.chunk_state.platform,
        );
        self.cv_stack.clear();
        self
    }

    /// The total number of input bytes so far.
    pub fn count(&self) -> u64 {
        self.chunk_state.chunk_counter * CHUNK_LEN as u64 + self.chunk_state.len() as u64
    }

    // Each entry on the stack stands for a power-of-two number of chunks, and
    // each entry that should remain is a 1-bit in the chunk count so far.
    // Merging down to popcount(total_chunks) therefore leaves exactly the
    // subtrees that can't be completed yet.
    fn merge_cv_stack(&mut self, total_chunks: u64) {
        let post_merge_stack_len = total_chunks.count_ones() as usize;
        while self.cv_stack.len() > post_merge_stack_len {
            let num_cvs = self.cv_stack.len();
            let parent_cv = parent_node_output(
                &self.cv_stack[num_cvs - 2],
                &self.cv_stack[num_cvs - 1],
                &self.key,
                self.chunk_state.flags,
                self.chunk_state.platform,
            )
            .chaining_value();
            self.cv_stack[num_cvs - 2] = parent_cv;
            self.cv_stack.truncate(num_cvs - 1);
        }
    }

    // Merges use the CV already on top of the stack, and the new CV goes on
    // unmerged. So the rightmost CV is never merged before we know more input
    // is coming, and no merge here can produce the root. This is also why
    // update() pushes both halves of compress_subtree_to_parent_node()
    // separately: a large first write might turn out to be the whole tree.
    fn push_cv(&mut self, new_cv: &CVBytes, chunk_counter: u64) {
        self.merge_cv_stack(chunk_counter);
        self.cv_stack.push(*new_cv);
    }

    /// Add input bytes to the hash state. You can call this any number of
    /// times.
    ///
    /// This method is always single-threaded, but it uses SIMD parallelism
    /// internally. For best performance, pass buffers that are a multiple of
    /// [`copy::BUF_LEN`](copy/constant.BUF_LEN.html) bytes.
    pub fn update(&mut self, mut input: &[u8]) -> &mut Self {
        // Finish a partial chunk first.
        if self.chunk_state.len() > 0 {
            let want = CHUNK_LEN - self.chunk_state.len();
            let take = cmp::min(want, input.len());
            self.chunk_state.update(&input[..take]);
            input = &input[take..];
            if !input.is_empty() {
                // More input follows, so this chunk isn't the root.
                debug_assert_eq!(self.chunk_state.len(), CHUNK_LEN);
                let chunk_cv = self.chunk_state.output().chaining_value();
                self.push_cv(&chunk_cv, self.chunk_state.chunk_counter);
                self.chunk_state = ChunkState::new(
                    &self.key,
                    self.chunk_state.chunk_counter + 1,
                    self.chunk_state.flags,
                    self.chunk_state.platform,
                );
            } else {
                return self;
            }
        }

        // While more than a chunk remains, hash the largest subtree that is a
        // power of two chunks and whose size divides the chunk count so far.
        // Only subtrees on the right edge may be incomplete.
        while input.len() > CHUNK_LEN {
            debug_assert_eq!(self.chunk_state.len(), 0, "no partial chunk data");
            debug_assert_eq!(CHUNK_LEN.count_ones(), 1, "power of 2 chunk len");
            let mut subtree_len = largest_power_of_two_leq(input.len());
            while ((subtree_len / CHUNK_LEN) as u64 - 1) & self.chunk_state.chunk_counter != 0 {
                subtree_len /= 2;
            }
            let subtree_chunks = (subtree_len / CHUNK_LEN) as u64;
            let flags = self.chunk_state.flags;
            let platform = self.chunk_state.platform;
            if subtree_len <= CHUNK_LEN {
                debug_assert_eq!(subtree_len, CHUNK_LEN);
                let chunk_cv = ChunkState::new(
                    &self.key,
                    self.chunk_state.chunk_counter,
                    flags,
                    platform,
                )
                .update(&input[..subtree_len])
                .output()
                .chaining_value();
                self.push_cv(&chunk_cv, self.chunk_state.chunk_counter);
            } else {
                let cv_pair = compress_subtree_to_parent_node(
                    &input[..subtree_len],
                    &self.key,
                    self.chunk_state.chunk_counter,
                    flags,
                    platform,
                );
                let left_cv = array_ref!(cv_pair, 0, OUT_LEN);
                let right_cv = array_ref!(cv_pair, OUT_LEN, OUT_LEN);
                // Push both halves. Lazy merging keeps the top one unmerged.
                self.push_cv(left_cv, self.chunk_state.chunk_counter);
                self.push_cv(
                    right_cv,
                    self.chunk_state.chunk_counter + (subtree_chunks / 2),
                );
            }
            self.chunk_state.chunk_counter += subtree_chunks;
            input = &input[subtree_len..];
        }

        debug_assert!(input.len() <= CHUNK_LEN);
        if !input.is_empty() {
            self.chunk_state.update(input);
            // Nothing on the stack can be the root now, so merge fully.
            self.merge_cv_stack(self.chunk_state.chunk_counter);
        }

        self
    }

    fn final_output(&self) -> Output {
        // A lone chunk is the root.
        if self.cv_stack.is_empty() {
            debug_assert_eq!(self.chunk_state.chunk_counter, 0);
            return self.chunk_state.output();
        }

        // With buffered bytes, update() left the stack fully merged and the
        // partial chunk is the rightmost leaf. Without, the top two stack
        // entries are the rightmost pair. Either way, fold the rest of the
        // stack in from the right.
        let mut output: Output;
        let mut num_cvs_remaining = self.cv_stack.len();
        if self.chunk_state.len() > 0 {
            debug_assert_eq!(
                self.cv_stack.len(),
                self.chunk_state.chunk_counter.count_ones() as usize,
                "cv stack does not need a merge"
            );
            output = self.chunk_state.output();
        } else {
            debug_assert!(self.cv_stack.len() >= 2);
            output = parent_node_output(
                &self.cv_stack[num_cvs_remaining - 2],
                &self.cv_stack[num_cvs_remaining - 1],
                &self.key,
                self.chunk_state.flags,
                self.chunk_state.platform,
            );
            num_cvs_remaining -= 2;
        }
        while num_cvs_remaining > 0 {
            output = parent_node_output(
                &self.cv_stack[num_cvs_remaining - 1],
                &output.chaining_value(),
                &self.key,
                self.chunk_state.flags,
                self.chunk_state.platform,
            );
            num_cvs_remaining -= 1;
        }
        output
    }

    /// Finalize the hash state and return the [`Hash`](struct.Hash.html) of
    /// the input.
    ///
    /// This method is idempotent. Calling it twice will give the same result.
    /// You can also add more input and finalize again.
    pub fn finalize(&self) -> Hash {
        self.final_output().root_hash()
    }

    /// Fill `out` with output bytes starting from position zero. Any length
    /// works, including zero, and shorter outputs are prefixes of longer
    /// ones.
    pub fn finalize_into(&self, out: &mut [u8]) {
        self.finalize_seek(0, out);
    }

    /// Fill `out` with output bytes starting from position `seek`. The caller
    /// must keep `seek + out.len()` below 2^64.
    pub fn finalize_seek(&self, seek: u64, out: &mut [u8]) {
        self.final_output().root_output_bytes(seek, out);
    }

    /// Finalize the hash state and return an [`OutputReader`], which can
    /// supply any number of output bytes.
    ///
    /// This method is idempotent. Calling it twice will give the same result.
    /// You can also add more input and finalize again.
    ///
    /// [`OutputReader`]: struct.OutputReader.html
    pub fn finalize_xof(&self) -> OutputReader {
        OutputReader::new(self.final_output())
    }
}

// Don't derive(Debug), because the state may be secret.
impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("count", &self.count())
            .field("cv_stack_len", &self.cv_stack.len())
            .field("chunk_state", &self.chunk_state)
            .finish()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for Hasher {
    /// This is equivalent to [`update`](#method.update).
    #[inline]
    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        self.update(input);
        Ok(input.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An incremental reader for extended output, returned by
/// [`Hasher::finalize_xof`](struct.Hasher.html#method.finalize_xof).
///
/// Reading never fails and never comes up short: the output stream is
/// effectively infinite. Seeking is supported relative to the start and to
/// the current position. Positions at or beyond 2^64 bytes are not supported.
#[derive(Clone)]
pub struct OutputReader {
    inner: Output,
    position: u64,
}

impl OutputReader {
    fn new(inner: Output) -> Self {
        Self { inner, position: 0 }
    }

    /// Fill `buf` with output bytes from the current position, and advance
    /// the position by `buf.len()`.
    pub fn fill(&mut self, buf: &mut [u8]) {
        self.inner.root_output_bytes(self.position, buf);
        self.position += buf.len() as u64;
    }

    /// The current position in the output stream, in bytes.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Seek to a new position in the output stream.
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }
}

// Don't derive(Debug), because the state may be secret.
impl fmt::Debug for OutputReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OutputReader")
            .field("position", &self.position)
            .finish()
    }
}

impl io::Read for OutputReader {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill(buf);
        Ok(buf.len())
    }
}

impl io::Seek for OutputReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target_position: i128 = match pos {
            io::SeekFrom::Start(x) => x as i128,
            io::SeekFrom::Current(x) => self.position as i128 + x as i128,
            io::SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "seek from end not supported",
                ));
            }
        };
        if target_position < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        if target_position > u64::max_value() as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek past 2^64 bytes",
            ));
        }
        self.position = target_position as u64;
        Ok(self.position)
    }
}
