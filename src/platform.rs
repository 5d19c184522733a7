use crate::{portable, CVWords, IncrementCounter, BLOCK_LEN};
use arrayref::array_refs;
use std::sync::OnceLock;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use crate::sse41;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub const MAX_SIMD_DEGREE: usize = 4;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub const MAX_SIMD_DEGREE: usize = 1;

// Parent compression needs room for at least two CVs even when there's no
// SIMD, so that a subtree can always be reduced to a single parent node.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub const MAX_SIMD_DEGREE_OR_2: usize = 4;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub const MAX_SIMD_DEGREE_OR_2: usize = 2;

type CompressInPlaceFn =
    unsafe fn(cv: &mut CVWords, block: &[u8; BLOCK_LEN], block_len: u8, counter: u64, flags: u8);

type CompressXofFn = unsafe fn(
    cv: &CVWords,
    block: &[u8; BLOCK_LEN],
    block_len: u8,
    counter: u64,
    flags: u8,
) -> [u8; 64];

type HashManyFn = unsafe fn(
    inputs: &[*const u8],
    blocks: usize,
    key: &CVWords,
    counter: u64,
    increment_counter: IncrementCounter,
    flags: u8,
    flags_start: u8,
    flags_end: u8,
    out: &mut [u8],
);

/// A compression backend, chosen once per process. Every backend produces
/// identical bytes; they differ only in how many inputs `hash_many` works on
/// at once.
#[derive(Clone, Copy)]
pub struct Platform {
    name: &'static str,
    simd_degree: usize,
    compress_in_place_fn: CompressInPlaceFn,
    compress_xof_fn: CompressXofFn,
    hash_many_fn: HashManyFn,
}

impl Platform {
    /// The fastest backend the current CPU supports. Detection runs on first
    /// use and the result is cached for the life of the process.
    pub fn detect() -> Self {
        static DETECTED: OnceLock<Platform> = OnceLock::new();
        *DETECTED.get_or_init(|| {
            let platform = Self::detect_uncached();
            tracing::debug!(
                backend = platform.name,
                simd_degree = platform.simd_degree,
                "selected compression backend"
            );
            platform
        })
    }

    fn detect_uncached() -> Self {
        #[cfg(not(feature = "pure"))]
        {
            if let Some(platform) = Self::sse41() {
                return platform;
            }
        }
        Self::portable()
    }

    pub fn portable() -> Self {
        Self {
            name: "portable",
            simd_degree: 1,
            compress_in_place_fn: compress_in_place_portable,
            compress_xof_fn: compress_xof_portable,
            hash_many_fn: portable::hash_many,
        }
    }

    /// The SSE4.1 backend, if this CPU has SSE4.1.
    pub fn sse41() -> Option<Self> {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if is_x86_feature_detected!("sse4.1") {
                return Some(Self {
                    name: "sse41",
                    simd_degree: sse41::DEGREE,
                    compress_in_place_fn: sse41::compress_in_place,
                    compress_xof_fn: sse41::compress_xof,
                    hash_many_fn: sse41::hash_many,
                });
            }
        }
        None
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn simd_degree(&self) -> usize {
        debug_assert!(self.simd_degree <= MAX_SIMD_DEGREE);
        self.simd_degree
    }

    pub fn compress_in_place(
        &self,
        cv: &mut CVWords,
        block: &[u8; BLOCK_LEN],
        block_len: u8,
        counter: u64,
        flags: u8,
    ) {
        // Safe because the constructors only hand out backends the CPU
        // supports.
        unsafe { (self.compress_in_place_fn)(cv, block, block_len, counter, flags) }
    }

    pub fn compress_xof(
        &self,
        cv: &CVWords,
        block: &[u8; BLOCK_LEN],
        block_len: u8,
        counter: u64,
        flags: u8,
    ) -> [u8; 64] {
        // Safe for the same reason as compress_in_place.
        unsafe { (self.compress_xof_fn)(cv, block, block_len, counter, flags) }
    }

    /// Hash each input with the same key and flags, writing one 32-byte CV per
    /// input into `out`. `A` is a byte array whose length is a whole number
    /// of blocks: whole chunks for leaves, a single block for parents.
    pub fn hash_many<A: arrayvec::Array<Item = u8>>(
        &self,
        inputs: &[&A],
        key: &CVWords,
        counter: u64,
        increment_counter: IncrementCounter,
        flags: u8,
        flags_start: u8,
        flags_end: u8,
        out: &mut [u8],
    ) {
        assert!(out.len() >= inputs.len() * crate::OUT_LEN, "out too short");
        debug_assert_eq!(A::CAPACITY % BLOCK_LEN, 0, "partial blocks");
        let blocks = A::CAPACITY / BLOCK_LEN;
        unsafe {
            // Safe because references and pointers have the same layout, and
            // because the block count comes from the array type itself.
            let input_ptrs: &[*const u8] =
                core::slice::from_raw_parts(inputs.as_ptr() as *const *const u8, inputs.len());
            (self.hash_many_fn)(
                input_ptrs,
                blocks,
                key,
                counter,
                increment_counter,
                flags,
                flags_start,
                flags_end,
                out,
            );
        }
    }
}

impl core::fmt::Debug for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Platform")
            .field("name", &self.name)
            .field("simd_degree", &self.simd_degree)
            .finish()
    }
}

unsafe fn compress_in_place_portable(
    cv: &mut CVWords,
    block: &[u8; BLOCK_LEN],
    block_len: u8,
    counter: u64,
    flags: u8,
) {
    portable::compress_in_place(cv, block, block_len, counter, flags)
}

unsafe fn compress_xof_portable(
    cv: &CVWords,
    block: &[u8; BLOCK_LEN],
    block_len: u8,
    counter: u64,
    flags: u8,
) -> [u8; 64] {
    portable::compress_xof(cv, block, block_len, counter, flags)
}

#[inline(always)]
pub fn le_bytes_from_words_32(words: &CVWords) -> [u8; 32] {
    let mut out = [0; 32];
    for (bytes, word) in out.chunks_exact_mut(4).zip(words.iter()) {
        bytes.copy_from_slice(&word.to_le_bytes());
    }
    out
}

#[inline(always)]
pub fn words_from_le_bytes_32(bytes: &[u8; 32]) -> CVWords {
    let refs = array_refs!(bytes, 4, 4, 4, 4, 4, 4, 4, 4);
    [
        u32::from_le_bytes(*refs.0),
        u32::from_le_bytes(*refs.1),
        u32::from_le_bytes(*refs.2),
        u32::from_le_bytes(*refs.3),
        u32::from_le_bytes(*refs.4),
        u32::from_le_bytes(*refs.5),
        u32::from_le_bytes(*refs.6),
        u32::from_le_bytes(*refs.7),
    ]
}
