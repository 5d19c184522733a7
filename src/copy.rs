use crate::{CHUNK_LEN, MAX_SIMD_DEGREE};
use std::io;

/// An efficient buffer size for [`Hasher`](../struct.Hasher.html).
///
/// The hasher is single threaded, but it uses SIMD parallelism to hash several
/// chunks at once. It only gets to do that when a single `update` call
/// supplies enough whole chunks to fill every lane, so callers that control
/// their buffer size should use this constant or an integer multiple of it.
///
/// On x86 the SSE4.1 backend hashes 4 chunks in parallel, and chunks are 1024
/// bytes, so `BUF_LEN` is currently 4096 bytes.
pub const BUF_LEN: usize = MAX_SIMD_DEGREE * CHUNK_LEN;

// This is an implementation detail of libstd, and if it changes there we
// should update it here. This is covered in the tests.
#[allow(dead_code)]
const STD_DEFAULT_BUF_LEN: usize = 8192;

// Large enough to beat the libstd default, and a multiple of BUF_LEN on every
// target. Both properties are covered in the tests.
const COPY_BUF_LEN: usize = 16 * CHUNK_LEN;

/// Copies the entire contents of a reader into a writer, just like
/// [`std::io::copy`](https://doc.rust-lang.org/std/io/fn.copy.html), using a
/// buffer size that's more efficient for [`Hasher`](../struct.Hasher.html).
///
/// Returns the number of bytes copied.
///
/// # Example
///
/// ```
/// let mut hasher = b3hash::Hasher::new();
/// let input = vec![0xab; 100_000];
/// b3hash::copy::copy_wide(&mut &input[..], &mut hasher).unwrap();
/// assert_eq!(hasher.finalize(), b3hash::hash(&input));
/// ```
pub fn copy_wide(reader: &mut impl io::Read, writer: &mut impl io::Write) -> io::Result<u64> {
    let mut buffer = [0; COPY_BUF_LEN];
    let mut total = 0;
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                writer.write_all(&buffer[..n])?;
                total += n as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
