use crate::*;

use arrayref::array_ref;
use std::io::{Read, Seek, SeekFrom, Write};

// Interesting input lengths to run tests on.
pub const TEST_CASES: &[usize] = &[
    0,
    1,
    BLOCK_LEN - 1,
    BLOCK_LEN,
    BLOCK_LEN + 1,
    CHUNK_LEN - 1,
    CHUNK_LEN,
    CHUNK_LEN + 1,
    2 * CHUNK_LEN,
    2 * CHUNK_LEN + 1,
    3 * CHUNK_LEN,
    3 * CHUNK_LEN + 1,
    4 * CHUNK_LEN,
    4 * CHUNK_LEN + 1,
    5 * CHUNK_LEN,
    5 * CHUNK_LEN + 1,
    6 * CHUNK_LEN,
    6 * CHUNK_LEN + 1,
    7 * CHUNK_LEN,
    7 * CHUNK_LEN + 1,
    8 * CHUNK_LEN,
    8 * CHUNK_LEN + 1,
    16 * CHUNK_LEN,
    31 * CHUNK_LEN, // 16 + 8 + 4 + 2 + 1
];

pub const TEST_CASES_MAX: usize = 31 * CHUNK_LEN;

// Paint a byte pattern that won't repeat, so that we don't accidentally
// miss buffer offset bugs.
pub fn paint_test_input(buf: &mut [u8]) {
    let mut offset = 0;
    let mut counter: u32 = 1;
    while offset < buf.len() {
        let bytes = counter.to_le_bytes();
        let take = cmp::min(bytes.len(), buf.len() - offset);
        buf[offset..][..take].copy_from_slice(&bytes[..take]);
        counter += 1;
        offset += take;
    }
}

// The input pattern of the published BLAKE3 test vectors.
fn vector_input(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

const VECTOR_KEY: &[u8; KEY_LEN] = b"whats the Elvish word for friend";
const VECTOR_CONTEXT: &str = "BLAKE3 2019-12-27 16:29:52 test vectors context";

fn hex_hash(hex_str: &str) -> Hash {
    let mut bytes = [0; OUT_LEN];
    hex::decode_to_slice(hex_str, &mut bytes).unwrap();
    bytes.into()
}

#[test]
fn test_counter_words() {
    let counter: u64 = (1 << 32) + 2;
    assert_eq!(counter_low(counter), 2);
    assert_eq!(counter_high(counter), 1);
}

#[test]
fn test_largest_power_of_two_leq() {
    let input_output = &[
        // The zero case is nonsensical, but it does work.
        (0, 1),
        (1, 1),
        (2, 2),
        (3, 2),
        (4, 4),
        (5, 4),
        (6, 4),
        (7, 4),
        (8, 8),
        // the largest possible usize
        (usize::max_value(), (usize::max_value() >> 1) + 1),
    ];
    for &(input, output) in input_output {
        assert_eq!(
            output,
            largest_power_of_two_leq(input),
            "wrong output for n={}",
            input
        );
    }
}

#[test]
fn test_left_len() {
    let input_output = &[
        (CHUNK_LEN + 1, CHUNK_LEN),
        (2 * CHUNK_LEN - 1, CHUNK_LEN),
        (2 * CHUNK_LEN, CHUNK_LEN),
        (2 * CHUNK_LEN + 1, 2 * CHUNK_LEN),
        (4 * CHUNK_LEN - 1, 2 * CHUNK_LEN),
        (4 * CHUNK_LEN, 2 * CHUNK_LEN),
        (4 * CHUNK_LEN + 1, 4 * CHUNK_LEN),
    ];
    for &(input, output) in input_output {
        assert_eq!(left_len(input), output);
    }
}

#[test]
fn test_published_vectors() {
    let cases: &[(usize, &str)] = &[
        (0, "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"),
        (1, "2d3adedff11b61f14c886e35afa036736dcd87a74d27b5c1510225d0f592e213"),
        (1023, "10108970eeda3eb932baac1428c7a2163b0e924c9a9e25b35bba72b28f70bd11"),
        (1024, "42214739f095a406f3fc83deb889744ac00df831c10daa55189b5d121c855af7"),
        (1025, "d00278ae47eb27b34faecf67b4fe263f82d5412916c1ffd97c8cb7fb814b8444"),
        (2048, "e776b6028c7cd22a4d0ba182a8bf62205d2ef576467e838ed6f2529b85fba24a"),
        (2049, "5f4d72f40d7a5f82b15ca2b2e44b1de3c2ef86c426c95c1af0b6879522563030"),
        (3073, "7124b49501012f81cc7f11ca069ec9226cecb8a2c850cfe644e327d22d3e1cd3"),
        (8193, "bab6c09cb8ce8cf459261398d2e7aef35700bf488116ceb94a36d0f5f1b7bc3b"),
        (31744, "62b6960e1a44bcc1eb1a611a8d6235b6b4b78f32e7abc4fb4c6cdcce94895c47"),
        (100_000, "d93c23eedaf165a7e0be908ba86f1a7a520d568d2d13cde787c8580c5c72cc54"),
    ];
    for &(len, expected_hex) in cases {
        let input = vector_input(len);
        let expected = hex_hash(expected_hex);
        assert_eq!(expected, hash(&input), "one-shot, len {}", len);
        assert_eq!(
            expected,
            Hasher::new().update(&input).finalize(),
            "incremental, len {}",
            len
        );
    }
}

#[test]
fn test_published_len0_xof_prefix() {
    let expected = hex::decode(
        "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262\
         e00f03e7b69af26b7faaf09fcd333050338ddfe085b8cc869ca98b206c08243a\
         26f5487789e8f660afe6c99ef9e0c52b92e7393024a80459cf91f476f9ffdbda\
         7001c22e159b402631f277ca96f2defdf1078282314e763699a31c5363165421\
         cce14d",
    )
    .unwrap();
    assert_eq!(expected.len(), 131);
    let mut out = [0; 131];
    Hasher::new().finalize_into(&mut out);
    assert_eq!(&expected[..], &out[..]);
}

#[test]
fn test_published_keyed_and_derive_key() {
    let empty = vector_input(0);
    assert_eq!(
        hex_hash("92b2b75604ed3c761f9d6f62392c8a9227ad0ea3f09573e783f1498a4ed60d26"),
        Hasher::new_keyed(VECTOR_KEY).update(&empty).finalize()
    );
    assert_eq!(
        hex_hash("2cc39783c223154fea8dfb7c1b1660f2ac2dcbd1c1de8277b0b0dd39b7e50d7d"),
        Hasher::new_derive_key(VECTOR_CONTEXT.as_bytes())
            .update(&empty)
            .finalize()
    );

    let input = vector_input(1025);
    assert_eq!(
        hex_hash("357dc55de0c7e382c900fd6e320acc04146be01db6a8ce7210b7189bd664ea69"),
        keyed_hash(VECTOR_KEY, &input)
    );
    assert_eq!(
        hex_hash("effaa245f065fbf82ac186839a249707c3bddf6d3fdda22d1b95a3c970379bcb"),
        Hash::from(derive_key(VECTOR_CONTEXT.as_bytes(), &input))
    );
}

#[test]
fn test_repeated_a() {
    let input = [b'A'; 4096];
    let expected = hex_hash("4598e001cd6e4c4fe4aa57bb055c11f1cbe10b3e0def42de0da8ec4036500f6c");
    assert_eq!(expected, hash(&input));
    let mut hasher = Hasher::new();
    for piece in input.chunks(1000) {
        hasher.update(piece);
    }
    assert_eq!(expected, hasher.finalize());
}

#[test]
fn test_compare_blake3_crate() {
    const OUT: usize = 303; // more than 64, not a multiple of 4
    let mut input_buf = [0; TEST_CASES_MAX];
    paint_test_input(&mut input_buf);
    for &case in TEST_CASES {
        let input = &input_buf[..case];
        dbg!(case);

        // regular
        {
            let mut expected_out = [0; OUT];
            blake3::Hasher::new()
                .update(input)
                .finalize_xof()
                .fill(&mut expected_out);

            let test_out = hash(input);
            assert_eq!(test_out, *array_ref!(expected_out, 0, 32));
            let mut hasher = Hasher::new();
            hasher.update(input);
            assert_eq!(hasher.finalize(), *array_ref!(expected_out, 0, 32));
            assert_eq!(hasher.finalize(), test_out);
            let mut extended = [0; OUT];
            hasher.finalize_xof().fill(&mut extended);
            assert_eq!(&extended[..], &expected_out[..]);
        }

        // keyed
        {
            let key = array_ref!(input_buf, 7, KEY_LEN);
            let mut expected_out = [0; OUT];
            blake3::Hasher::new_keyed(key)
                .update(input)
                .finalize_xof()
                .fill(&mut expected_out);

            let test_out = keyed_hash(key, input);
            assert_eq!(test_out, *array_ref!(expected_out, 0, 32));
            let mut hasher = Hasher::new_keyed(key);
            hasher.update(input);
            assert_eq!(hasher.finalize(), *array_ref!(expected_out, 0, 32));
            let mut extended = [0; OUT];
            hasher.finalize_xof().fill(&mut extended);
            assert_eq!(&extended[..], &expected_out[..]);
        }

        // derive_key
        {
            let context = "b3hash 2020-01-01 12:00:00 test context";
            let mut expected_out = [0; OUT];
            blake3::Hasher::new_derive_key(context)
                .update(input)
                .finalize_xof()
                .fill(&mut expected_out);

            let test_out = derive_key(context.as_bytes(), input);
            assert_eq!(test_out, *array_ref!(expected_out, 0, 32));
            let mut hasher = Hasher::new_derive_key(context.as_bytes());
            hasher.update(input);
            assert_eq!(hasher.finalize(), *array_ref!(expected_out, 0, 32));
            let mut extended = [0; OUT];
            hasher.finalize_xof().fill(&mut extended);
            assert_eq!(&extended[..], &expected_out[..]);
        }
    }
}

#[test]
fn test_chunking_invariance() {
    let mut input_buf = [0; TEST_CASES_MAX];
    paint_test_input(&mut input_buf);
    for &case in TEST_CASES {
        let input = &input_buf[..case];
        let expected = hash(input);

        let mut one_at_a_time = Hasher::new();
        for &byte in input {
            one_at_a_time.update(&[byte]);
        }
        assert_eq!(expected, one_at_a_time.finalize(), "bytewise, len {}", case);

        // Irregular splits that straddle block, chunk, and subtree boundaries.
        for &split in &[1, 63, 65, 1000, 1025, 3 * CHUNK_LEN - 1, 4 * CHUNK_LEN + 5] {
            let mut hasher = Hasher::new();
            for piece in input.chunks(split) {
                hasher.update(piece);
            }
            assert_eq!(expected, hasher.finalize(), "split {}, len {}", split, case);
        }

        // A lopsided split: one byte, then everything else.
        if case > 1 {
            let mut hasher = Hasher::new();
            hasher.update(&input[..1]);
            hasher.update(&input[1..]);
            assert_eq!(expected, hasher.finalize(), "lopsided, len {}", case);
        }
    }
}

#[test]
fn test_empty_updates_change_nothing() {
    let mut input = [0; 3 * CHUNK_LEN];
    paint_test_input(&mut input);
    let mut hasher = Hasher::new();
    hasher.update(&[]);
    hasher.update(&input[..CHUNK_LEN]);
    hasher.update(&[]);
    hasher.update(&input[CHUNK_LEN..]);
    hasher.update(&[]);
    assert_eq!(hash(&input), hasher.finalize());
}

#[test]
fn test_xof_prefix() {
    let mut input = [0; 5000];
    paint_test_input(&mut input);
    let mut hasher = Hasher::new();
    hasher.update(&input);
    let mut long = [0; 500];
    hasher.finalize_into(&mut long);
    assert_eq!(&long[..OUT_LEN], hasher.finalize().as_bytes());

    let mut short = [0; 33];
    hasher.finalize_into(&mut short);
    assert_eq!(&long[..33], &short[..]);
}

#[test]
fn test_finalize_seek() {
    let input = b"abc";
    let mut hasher = Hasher::new();
    hasher.update(input);

    let mut first_64 = [0; 64];
    hasher.finalize_seek(0, &mut first_64);
    let mut second_32 = [0; 32];
    hasher.finalize_seek(32, &mut second_32);
    assert_eq!(&first_64[32..], &second_32[..]);

    // Every offset and length within a few blocks agrees with one long read.
    let mut long = [0; 4 * BLOCK_LEN];
    hasher.finalize_into(&mut long);
    for seek in 0..2 * BLOCK_LEN {
        for &len in &[0, 1, 31, 64, 65, BLOCK_LEN + 7] {
            let mut out = [0; BLOCK_LEN + 7];
            hasher.finalize_seek(seek as u64, &mut out[..len]);
            assert_eq!(&long[seek..][..len], &out[..len], "seek {} len {}", seek, len);
        }
    }

    // Compare a far seek with the blake3 crate.
    let mut expected = [0; 100];
    let mut upstream = blake3::Hasher::new();
    upstream.update(input);
    let mut reader = upstream.finalize_xof();
    reader.set_position(1 << 40);
    reader.fill(&mut expected);
    let mut out = [0; 100];
    hasher.finalize_seek(1 << 40, &mut out);
    assert_eq!(&expected[..], &out[..]);
}

#[test]
fn test_zero_length_output() {
    let mut hasher = Hasher::new();
    hasher.update(b"abc");
    let mut out = [0u8; 0];
    hasher.finalize_into(&mut out);
    hasher.finalize_seek(12345, &mut out);
    hasher.finalize_xof().fill(&mut out);
    assert_eq!(hasher.finalize_xof().read(&mut out).unwrap(), 0);
}

#[test]
fn test_key_sensitivity() {
    let input = b"the same input";
    let mut key = [0; KEY_LEN];
    paint_test_input(&mut key);
    let base = keyed_hash(&key, input);
    for i in 0..KEY_LEN {
        let mut flipped = key;
        flipped[i] ^= 1;
        assert!(base != keyed_hash(&flipped, input), "byte {}", i);
    }
    // Keyed mode is domain separated from plain hashing, even with an all
    // zero key.
    assert!(hash(input) != keyed_hash(&[0; KEY_LEN], input));
    // And derive-key mode is separated from both.
    let derived = Hash::from(derive_key(b"", input));
    assert!(derived != hash(input));
}

#[test]
fn test_try_new_keyed() {
    let mut key = [0; 40];
    paint_test_input(&mut key);

    let hasher = Hasher::try_new_keyed(&key[..KEY_LEN]).unwrap();
    assert_eq!(
        hasher.finalize(),
        Hasher::new_keyed(array_ref!(key, 0, KEY_LEN)).finalize()
    );

    for &bad_len in &[0, 16, KEY_LEN - 1, KEY_LEN + 1, 40] {
        match Hasher::try_new_keyed(&key[..bad_len]) {
            Err(Error::InvalidKeyLength { expected, actual }) => {
                assert_eq!(expected, KEY_LEN);
                assert_eq!(actual, bad_len);
            }
            Ok(_) => panic!("accepted a {}-byte key", bad_len),
        }
    }
}

#[test]
fn test_cv_stack_len_is_popcount() {
    let mut input = vec![0; 40 * CHUNK_LEN + 1];
    paint_test_input(&mut input);

    // In a single update, whole chunks followed by a partial one.
    for chunks in 1..=40usize {
        let mut hasher = Hasher::new();
        hasher.update(&input[..chunks * CHUNK_LEN + 1]);
        assert_eq!(hasher.chunk_state.chunk_counter, chunks as u64);
        assert_eq!(
            hasher.cv_stack.len(),
            chunks.count_ones() as usize,
            "chunks {}",
            chunks
        );
    }

    // Incrementally, checking after every update that leaves a partial chunk.
    let mut hasher = Hasher::new();
    for piece in input.chunks(CHUNK_LEN + 7) {
        hasher.update(piece);
        if hasher.chunk_state.len() > 0 {
            assert_eq!(
                hasher.cv_stack.len(),
                hasher.chunk_state.chunk_counter.count_ones() as usize
            );
        }
    }
    assert_eq!(hash(&input), hasher.finalize());
}

#[test]
fn test_unmerged_stack_when_buffer_empty() {
    let mut input = [0; 4 * CHUNK_LEN];
    paint_test_input(&mut input);
    let mut hasher = Hasher::new();

    // The first write could be the whole tree, so its two halves stay
    // separate.
    hasher.update(&input[..2 * CHUNK_LEN]);
    assert_eq!(hasher.cv_stack.len(), 2);
    assert_eq!(hasher.chunk_state.len(), 0);
    assert_eq!(hash(&input[..2 * CHUNK_LEN]), hasher.finalize());

    // Now the first pair merges, but the second pair stays unmerged.
    hasher.update(&input[2 * CHUNK_LEN..]);
    assert_eq!(hasher.cv_stack.len(), 3);
    assert_eq!(hasher.chunk_state.len(), 0);
    assert_eq!(hash(&input), hasher.finalize());
}

#[test]
fn test_merged_stack_len_is_popcount_when_buffer_empty() {
    const MAX_CHUNKS: usize = 64;
    let mut input = vec![0; MAX_CHUNKS * CHUNK_LEN + 1];
    paint_test_input(&mut input);

    // Writes of 2 and 4 whole chunks are hashed as subtrees, which leaves the
    // chunk buffer empty after every write.
    for &write_chunks in &[2usize, 4] {
        let mut hasher = Hasher::new();
        for (i, piece) in input[..MAX_CHUNKS * CHUNK_LEN]
            .chunks(write_chunks * CHUNK_LEN)
            .enumerate()
        {
            hasher.update(piece);
            let chunks = ((i + 1) * write_chunks) as u64;
            let len = chunks as usize * CHUNK_LEN;
            assert_eq!(hasher.chunk_state.len(), 0);
            assert_eq!(hasher.chunk_state.chunk_counter, chunks);
            assert!(hasher.cv_stack.len() <= (chunks - 1).count_ones() as usize + 1);

            let mut merged = hasher.clone();
            merged.merge_cv_stack(chunks);
            assert_eq!(
                merged.cv_stack.len(),
                chunks.count_ones() as usize,
                "chunks {}",
                chunks
            );

            // A full merge is only wrong if no more input arrives and the
            // stack collapsed to the root subtree.
            if chunks.count_ones() > 1 {
                assert_eq!(hash(&input[..len]), merged.finalize());
            }
            merged.update(&input[len..][..1]);
            assert_eq!(hash(&input[..len + 1]), merged.finalize());
            assert_eq!(hash(&input[..len]), hasher.finalize());
        }
    }
}

#[test]
fn test_finalize_is_a_query() {
    let mut input = [0; 3 * CHUNK_LEN];
    paint_test_input(&mut input);
    let mut hasher = Hasher::new();
    hasher.update(&input[..1500]);
    let first = hasher.finalize();
    assert_eq!(first, hasher.finalize());
    assert_eq!(first, hash(&input[..1500]));
    hasher.update(&input[1500..]);
    assert_eq!(hash(&input), hasher.finalize());
}

#[test]
fn test_reset_and_count() {
    let mut input = [0; 5000];
    paint_test_input(&mut input);
    let key = [42; KEY_LEN];

    let mut hasher = Hasher::new_keyed(&key);
    assert_eq!(hasher.count(), 0);
    hasher.update(&input[..1]);
    assert_eq!(hasher.count(), 1);
    hasher.update(&input[1..]);
    assert_eq!(hasher.count(), input.len() as u64);

    hasher.reset();
    assert_eq!(hasher.count(), 0);
    assert_eq!(hasher.finalize(), keyed_hash(&key, b""));
    hasher.update(&input);
    assert_eq!(hasher.finalize(), keyed_hash(&key, &input));

    let mut derive_hasher = Hasher::new_derive_key(b"reset context");
    derive_hasher.update(&input);
    derive_hasher.reset();
    derive_hasher.update(b"abc");
    assert_eq!(
        *derive_hasher.finalize().as_bytes(),
        derive_key(b"reset context", b"abc")
    );
}

#[test]
fn test_output_reader() {
    let mut input = [0; 2000];
    paint_test_input(&mut input);
    let mut hasher = Hasher::new();
    hasher.update(&input);
    let mut expected = [0; 1000];
    hasher.finalize_into(&mut expected);

    // Reads in odd-sized pieces line up.
    let mut reader = hasher.finalize_xof();
    let mut out = [0; 1000];
    for piece in out.chunks_mut(37) {
        reader.fill(piece);
    }
    assert_eq!(&expected[..], &out[..]);
    assert_eq!(reader.position(), 1000);

    // io::Read never comes up short.
    let mut reader = hasher.finalize_xof();
    let mut out = [0; 100];
    assert_eq!(reader.read(&mut out).unwrap(), 100);
    assert_eq!(&expected[..100], &out[..]);

    // Seeking.
    assert_eq!(reader.seek(SeekFrom::Start(500)).unwrap(), 500);
    reader.fill(&mut out);
    assert_eq!(&expected[500..600], &out[..]);
    assert_eq!(reader.seek(SeekFrom::Current(-300)).unwrap(), 300);
    reader.fill(&mut out);
    assert_eq!(&expected[300..400], &out[..]);
    reader.set_position(7);
    reader.fill(&mut out[..10]);
    assert_eq!(&expected[7..17], &out[..10]);

    // There's no end to seek from, and no seeking before the start.
    let err = reader.seek(SeekFrom::End(0)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    let err = reader.seek(SeekFrom::Current(-1000)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    assert_eq!(reader.position(), 17);
}

#[test]
fn test_write_impl() {
    let mut input = [0; 10_000];
    paint_test_input(&mut input);
    let mut hasher = Hasher::new();
    hasher.write_all(&input).unwrap();
    hasher.flush().unwrap();
    assert_eq!(hash(&input), hasher.finalize());
}

#[test]
fn test_hash_conversions() {
    let h = hash(b"foo");
    let bytes: [u8; OUT_LEN] = h.into();
    assert_eq!(h, Hash::from(bytes));
    assert_eq!(h, bytes);
    assert_eq!(h.to_hex().len(), 2 * OUT_LEN);
    assert_eq!(h.to_string(), hex::encode(bytes));
    assert_eq!(format!("{:?}", h), format!("Hash(0x{})", hex::encode(bytes)));
}

#[test]
fn test_debug_does_not_leak_state() {
    let key = [0xab; KEY_LEN];
    let mut hasher = Hasher::new_keyed(&key);
    hasher.update(b"secret");
    let debug = format!("{:?}", hasher);
    assert!(debug.starts_with("Hasher"));
    assert!(!debug.contains("171")); // 0xab
    let debug = format!("{:?}", hasher.finalize_xof());
    assert_eq!(debug, "OutputReader { position: 0 }");
}

// Build the tree the slow way: split with left_len() all the way down,
// compressing every parent as soon as both children are known.
fn naive_subtree_output(
    input: &[u8],
    key: &CVWords,
    chunk_counter: u64,
    flags: u8,
    platform: Platform,
) -> Output {
    if input.len() <= CHUNK_LEN {
        let mut chunk_state = ChunkState::new(key, chunk_counter, flags, platform);
        chunk_state.update(input);
        return chunk_state.output();
    }
    let (left, right) = input.split_at(left_len(input.len()));
    let right_counter = chunk_counter + (left.len() / CHUNK_LEN) as u64;
    let left_cv = naive_subtree_output(left, key, chunk_counter, flags, platform).chaining_value();
    let right_cv = naive_subtree_output(right, key, right_counter, flags, platform).chaining_value();
    parent_node_output(&left_cv, &right_cv, key, flags, platform)
}

#[test]
fn test_compress_subtree() {
    let mut input_buf = [0; TEST_CASES_MAX];
    paint_test_input(&mut input_buf);
    let mut platforms = vec![Platform::portable(), Platform::detect()];
    platforms.extend(Platform::sse41());
    for &platform in &platforms {
        for &case in TEST_CASES.iter().filter(|&&case| case > CHUNK_LEN) {
            let input = &input_buf[..case];

            let mut cv_array = [0; MAX_SIMD_DEGREE_OR_2 * OUT_LEN];
            let num_cvs = compress_subtree_wide(input, IV, 0, 0, platform, &mut cv_array);
            assert!(num_cvs >= 2, "{} cvs for len {}", num_cvs, case);
            assert!(num_cvs <= cmp::max(platform.simd_degree(), 2));

            let parent_block = compress_subtree_to_parent_node(input, IV, 0, 0, platform);
            let naive = naive_subtree_output(input, IV, 0, 0, platform);
            assert_eq!(&naive.block[..], &parent_block[..], "len {}", case);
            assert_eq!(naive.flags, Flags::PARENT.bits());
            assert_eq!(naive.root_hash(), hash(input));
        }
    }
}

#[test]
fn test_compress_subtree_degree_one_pairs() {
    // With a single lane, two chunks come back as their raw chaining values.
    let mut input = [0; 2 * CHUNK_LEN];
    paint_test_input(&mut input);
    let platform = Platform::portable();
    let mut cv_array = [0; MAX_SIMD_DEGREE_OR_2 * OUT_LEN];
    let num_cvs = compress_subtree_wide(&input, IV, 0, 0, platform, &mut cv_array);
    assert_eq!(num_cvs, 2);
    let left = naive_subtree_output(&input[..CHUNK_LEN], IV, 0, 0, platform).chaining_value();
    let right = naive_subtree_output(&input[CHUNK_LEN..], IV, 1, 0, platform).chaining_value();
    assert_eq!(&cv_array[..OUT_LEN], &left[..]);
    assert_eq!(&cv_array[OUT_LEN..2 * OUT_LEN], &right[..]);
}

type Construction = fn(input_buf: &[u8], key: &CVWords, flags: u8) -> Hash;

fn exercise_construction(construction: Construction, input_len: usize) {
    let mut input_buf = [0; 65536];
    paint_test_input(&mut input_buf);
    let input = &input_buf[..input_len];

    // Check the default parameters.
    let expected_default_hash = construction(&input, IV, 0);
    assert_eq!(expected_default_hash, hash(&input));
    assert_eq!(
        expected_default_hash,
        Hasher::new().update(&input).finalize(),
    );
    let mut xof_bytes = [0; OUT_LEN];
    Hasher::new()
        .update(&input)
        .finalize_xof()
        .fill(&mut xof_bytes);
    assert_eq!(expected_default_hash, xof_bytes);

    // Check a key.
    let key = array_ref!(input, 7, KEY_LEN);
    let key_words = platform::words_from_le_bytes_32(key);
    let expected_keyed_hash = construction(&input, &key_words, Flags::KEYED_HASH.bits());
    assert_eq!(expected_keyed_hash, keyed_hash(key, &input));
    assert_eq!(
        expected_keyed_hash,
        Hasher::new_keyed(key).update(&input).finalize(),
    );
}

fn three_blocks_construction(input_buf: &[u8], key: &CVWords, flags: u8) -> Hash {
    let mut cv = *key;

    let block0 = array_ref!(input_buf, 0, BLOCK_LEN);
    portable::compress_in_place(
        &mut cv,
        &block0,
        BLOCK_LEN as u8,
        0,
        flags | Flags::CHUNK_START.bits(),
    );

    let block1 = array_ref!(input_buf, BLOCK_LEN, BLOCK_LEN);
    portable::compress_in_place(
        &mut cv,
        &block1,
        BLOCK_LEN as u8,
        0, // Subsequent blocks keep using the chunk's counter.
        flags, // Middle blocks have no start or end flags.
    );

    let mut block2 = [0; BLOCK_LEN];
    block2[0] = input_buf[2 * BLOCK_LEN];
    portable::compress_in_place(
        &mut cv,
        &block2,
        1,
        0, // Subsequent blocks keep using the chunk's counter.
        flags | (Flags::CHUNK_END | Flags::ROOT).bits(),
    );

    platform::le_bytes_from_words_32(&cv).into()
}

#[test]
fn test_three_blocks() {
    exercise_construction(three_blocks_construction, 2 * BLOCK_LEN + 1);
}

// This is equivalent to hashing a full chunk with ChunkState. Calling that from
// tests might hide bugs, so we reimplement a simple version of it here.
fn hash_whole_chunk_for_testing(
    chunk: &[u8],
    key: &CVWords,
    chunk_counter: u64,
    flags: u8,
) -> CVBytes {
    assert_eq!(chunk.len(), CHUNK_LEN);
    let blocks = CHUNK_LEN / BLOCK_LEN;
    let mut cv = *key;
    // First block.
    portable::compress_in_place(
        &mut cv,
        array_ref!(chunk, 0, BLOCK_LEN),
        BLOCK_LEN as u8,
        chunk_counter,
        flags | Flags::CHUNK_START.bits(),
    );
    // Middle blocks.
    for block_index in 1..blocks - 1 {
        portable::compress_in_place(
            &mut cv,
            array_ref!(chunk, block_index * BLOCK_LEN, BLOCK_LEN),
            BLOCK_LEN as u8,
            chunk_counter,
            flags,
        );
    }
    // Last block.
    portable::compress_in_place(
        &mut cv,
        array_ref!(chunk, (blocks - 1) * BLOCK_LEN, BLOCK_LEN),
        BLOCK_LEN as u8,
        chunk_counter,
        flags | Flags::CHUNK_END.bits(),
    );
    platform::le_bytes_from_words_32(&cv)
}

fn three_chunks_construction(input_buf: &[u8], key: &CVWords, flags: u8) -> Hash {
    // The first chunk.
    let chunk0_out = hash_whole_chunk_for_testing(&input_buf[..CHUNK_LEN], key, 0, flags);

    // The second chunk.
    let chunk1_out =
        hash_whole_chunk_for_testing(&input_buf[CHUNK_LEN..][..CHUNK_LEN], key, 1, flags);

    // The third and final chunk is one byte.
    let mut chunk2_block = [0; BLOCK_LEN];
    chunk2_block[0] = input_buf[2 * CHUNK_LEN];
    let mut chunk2_cv = *key;
    portable::compress_in_place(
        &mut chunk2_cv,
        &chunk2_block,
        1,
        2,
        flags | (Flags::CHUNK_START | Flags::CHUNK_END).bits(),
    );
    let chunk2_out = platform::le_bytes_from_words_32(&chunk2_cv);

    // The parent of the first two chunks.
    let mut left_parent_cv = *key;
    let mut left_parent_block = [0; BLOCK_LEN];
    left_parent_block[..OUT_LEN].copy_from_slice(&chunk0_out);
    left_parent_block[OUT_LEN..].copy_from_slice(&chunk1_out);
    portable::compress_in_place(
        &mut left_parent_cv,
        &left_parent_block,
        BLOCK_LEN as u8,
        0,
        flags | Flags::PARENT.bits(),
    );
    let left_parent_out = platform::le_bytes_from_words_32(&left_parent_cv);

    // The root node.
    let mut root_cv = *key;
    let mut root_block = [0; BLOCK_LEN];
    root_block[..OUT_LEN].copy_from_slice(&left_parent_out);
    root_block[OUT_LEN..].copy_from_slice(&chunk2_out);
    portable::compress_in_place(
        &mut root_cv,
        &root_block,
        BLOCK_LEN as u8,
        0,
        flags | (Flags::PARENT | Flags::ROOT).bits(),
    );
    platform::le_bytes_from_words_32(&root_cv).into()
}

#[test]
fn test_three_chunks() {
    exercise_construction(three_chunks_construction, 2 * CHUNK_LEN + 1);
}

#[test]
fn test_hasher_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync + Clone>() {}
    assert_send_sync::<Hasher>();
    assert_send_sync::<OutputReader>();
    assert_send_sync::<Hash>();
}
