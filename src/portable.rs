use crate::{
    counter_high, counter_low, CVBytes, CVWords, IncrementCounter, BLOCK_LEN, IV, MSG_SCHEDULE,
    OUT_LEN,
};
use arrayref::{array_mut_ref, array_refs};

#[inline(always)]
fn words_from_block(bytes: &[u8; BLOCK_LEN]) -> [u32; 16] {
    let refs = array_refs!(bytes, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4);
    [
        u32::from_le_bytes(*refs.0),
        u32::from_le_bytes(*refs.1),
        u32::from_le_bytes(*refs.2),
        u32::from_le_bytes(*refs.3),
        u32::from_le_bytes(*refs.4),
        u32::from_le_bytes(*refs.5),
        u32::from_le_bytes(*refs.6),
        u32::from_le_bytes(*refs.7),
        u32::from_le_bytes(*refs.8),
        u32::from_le_bytes(*refs.9),
        u32::from_le_bytes(*refs.10),
        u32::from_le_bytes(*refs.11),
        u32::from_le_bytes(*refs.12),
        u32::from_le_bytes(*refs.13),
        u32::from_le_bytes(*refs.14),
        u32::from_le_bytes(*refs.15),
    ]
}

#[inline(always)]
fn g(state: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize, x: u32, y: u32) {
    state[a] = state[a].wrapping_add(state[b]).wrapping_add(x);
    state[d] = (state[d] ^ state[a]).rotate_right(16);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_right(12);
    state[a] = state[a].wrapping_add(state[b]).wrapping_add(y);
    state[d] = (state[d] ^ state[a]).rotate_right(8);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_right(7);
}

#[inline(always)]
fn round(state: &mut [u32; 16], msg: &[u32; 16], round: usize) {
    // Select the message schedule based on the round.
    let schedule = MSG_SCHEDULE[round];

    // Mix the columns.
    g(state, 0, 4, 8, 12, msg[schedule[0]], msg[schedule[1]]);
    g(state, 1, 5, 9, 13, msg[schedule[2]], msg[schedule[3]]);
    g(state, 2, 6, 10, 14, msg[schedule[4]], msg[schedule[5]]);
    g(state, 3, 7, 11, 15, msg[schedule[6]], msg[schedule[7]]);

    // Mix the diagonals.
    g(state, 0, 5, 10, 15, msg[schedule[8]], msg[schedule[9]]);
    g(state, 1, 6, 11, 12, msg[schedule[10]], msg[schedule[11]]);
    g(state, 2, 7, 8, 13, msg[schedule[12]], msg[schedule[13]]);
    g(state, 3, 4, 9, 14, msg[schedule[14]], msg[schedule[15]]);
}

#[inline(always)]
fn compress_pre(
    cv: &CVWords,
    block: &[u8; BLOCK_LEN],
    block_len: u8,
    counter: u64,
    flags: u8,
) -> [u32; 16] {
    let block_words = words_from_block(block);
    let mut state = [
        cv[0],
        cv[1],
        cv[2],
        cv[3],
        cv[4],
        cv[5],
        cv[6],
        cv[7],
        IV[0],
        IV[1],
        IV[2],
        IV[3],
        counter_low(counter),
        counter_high(counter),
        block_len as u32,
        flags as u32,
    ];

    round(&mut state, &block_words, 0);
    round(&mut state, &block_words, 1);
    round(&mut state, &block_words, 2);
    round(&mut state, &block_words, 3);
    round(&mut state, &block_words, 4);
    round(&mut state, &block_words, 5);
    round(&mut state, &block_words, 6);

    state
}

pub fn compress_in_place(
    cv: &mut CVWords,
    block: &[u8; BLOCK_LEN],
    block_len: u8,
    counter: u64,
    flags: u8,
) {
    let state = compress_pre(cv, block, block_len, counter, flags);
    for i in 0..8 {
        cv[i] = state[i] ^ state[i + 8];
    }
}

pub fn compress_xof(
    cv: &CVWords,
    block: &[u8; BLOCK_LEN],
    block_len: u8,
    counter: u64,
    flags: u8,
) -> [u8; 64] {
    let state = compress_pre(cv, block, block_len, counter, flags);
    let mut output = [0u8; 64];
    for i in 0..8 {
        output[i * 4..][..4].copy_from_slice(&(state[i] ^ state[i + 8]).to_le_bytes());
        output[32 + i * 4..][..4].copy_from_slice(&(state[i + 8] ^ cv[i]).to_le_bytes());
    }
    output
}

// The input pointer must be valid for `blocks * BLOCK_LEN` bytes.
pub unsafe fn hash1(
    input: *const u8,
    blocks: usize,
    key: &CVWords,
    counter: u64,
    flags: u8,
    flags_start: u8,
    flags_end: u8,
    out: &mut CVBytes,
) {
    let mut cv = *key;
    let mut block_flags = flags | flags_start;
    for block in 0..blocks {
        if block + 1 == blocks {
            block_flags |= flags_end;
        }
        compress_in_place(
            &mut cv,
            &*(input.add(block * BLOCK_LEN) as *const [u8; BLOCK_LEN]),
            BLOCK_LEN as u8,
            counter,
            block_flags,
        );
        block_flags = flags;
    }
    *out = crate::platform::le_bytes_from_words_32(&cv);
}

// Every input pointer must be valid for `blocks * BLOCK_LEN` bytes.
pub unsafe fn hash_many(
    inputs: &[*const u8],
    blocks: usize,
    key: &CVWords,
    mut counter: u64,
    increment_counter: IncrementCounter,
    flags: u8,
    flags_start: u8,
    flags_end: u8,
    out: &mut [u8],
) {
    debug_assert!(out.len() >= inputs.len() * OUT_LEN, "out too short");
    for (&input, output) in inputs.iter().zip(out.chunks_exact_mut(OUT_LEN)) {
        hash1(
            input,
            blocks,
            key,
            counter,
            flags,
            flags_start,
            flags_end,
            array_mut_ref!(output, 0, OUT_LEN),
        );
        if increment_counter.yes() {
            counter += 1;
        }
    }
}
