use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::cmp;
use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "
Usage: b3hash [--length=<bytes>] [--seek=<offset>] [--key=<hex> | --derive-key=<context>] [<inputs>...]
       b3hash (--help | --version)

Options:
    --length=<bytes>        The number of output bytes [default: 32].
    --seek=<offset>         The output position to start from [default: 0].
    --key=<hex>             Use the keyed hash, with a 64-character hex key.
    --derive-key=<context>  Use the key derivation function, with this context.
    -h --help               Show this screen.
    --version               Show the version.
";

#[derive(Debug, Deserialize)]
struct Args {
    arg_inputs: Vec<PathBuf>,
    flag_length: u64,
    flag_seek: u64,
    flag_key: Option<String>,
    flag_derive_key: Option<String>,
    flag_help: bool,
    flag_version: bool,
}

fn main() -> Result<()> {
    // Quiet by default, override with RUST_LOG=b3hash=debug.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("b3hash=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Args = docopt::Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    debug!(?args, "parsed arguments");

    if args.flag_help {
        print!("{}", USAGE);
    } else if args.flag_version {
        println!("{}", VERSION);
    } else {
        hash(&args)?;
    }

    Ok(())
}

fn new_hasher(args: &Args) -> Result<b3hash::Hasher> {
    if let Some(ref key_hex) = args.flag_key {
        let key_bytes = hex::decode(key_hex).context("key must be hex")?;
        Ok(b3hash::Hasher::try_new_keyed(&key_bytes)?)
    } else if let Some(ref context) = args.flag_derive_key {
        Ok(b3hash::Hasher::new_derive_key(context.as_bytes()))
    } else {
        Ok(b3hash::Hasher::new())
    }
}

// Hash one input and return its output stream, positioned at --seek.
fn hash_one(maybe_path: &Option<PathBuf>, args: &Args) -> Result<b3hash::OutputReader> {
    let mut hasher = new_hasher(args)?;
    let mut input = open_input(maybe_path)?;
    if let Some(map) = maybe_memmap_input(&input)? {
        debug!(len = map.len(), "hashing a memory map");
        hasher.update(&map);
    } else {
        b3hash::copy::copy_wide(&mut input, &mut hasher)?;
    }
    let mut output = hasher.finalize_xof();
    output.set_position(args.flag_seek);
    Ok(output)
}

// Output can be longer than memory, so encode it a buffer at a time.
fn write_hex_output(
    mut output: b3hash::OutputReader,
    mut len: u64,
    out: &mut impl Write,
) -> Result<()> {
    let mut block = [0; b3hash::copy::BUF_LEN];
    let mut hex_block = [0; 2 * b3hash::copy::BUF_LEN];
    while len > 0 {
        let take = cmp::min(len, block.len() as u64) as usize;
        output.fill(&mut block[..take]);
        hex::encode_to_slice(&block[..take], &mut hex_block[..2 * take])?;
        out.write_all(&hex_block[..2 * take])?;
        len -= take as u64;
    }
    Ok(())
}

fn hash(args: &Args) -> Result<()> {
    if args.flag_seek.checked_add(args.flag_length).is_none() {
        bail!("--seek plus --length must be less than 2^64");
    }
    // Check the key up front, so that a bad key is one error and not one per
    // input.
    new_hasher(args)?;

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    if !args.arg_inputs.is_empty() {
        let mut did_error = false;
        for input in args.arg_inputs.iter() {
            let input_str = input.to_string_lossy();
            // As with b2sum or sha1sum, the multi-arg hash loop prints errors and keeps going.
            // This is more convenient for the user in cases like `b3hash *`, where it's common
            // that some of the inputs will error on read e.g. because they're directories.
            match hash_one(&Some(input.clone()), args) {
                Ok(output) => {
                    write_hex_output(output, args.flag_length, &mut stdout)?;
                    if args.arg_inputs.len() > 1 {
                        writeln!(stdout, "  {}", input_str)?;
                    } else {
                        writeln!(stdout)?;
                    }
                }
                Err(e) => {
                    did_error = true;
                    eprintln!("b3hash: {}: {}", input_str, e);
                }
            }
        }
        if did_error {
            stdout.flush()?;
            std::process::exit(1);
        }
    } else {
        let output = hash_one(&None, args)?;
        write_hex_output(output, args.flag_length, &mut stdout)?;
        writeln!(stdout)?;
    }
    Ok(())
}

fn open_input(maybe_path: &Option<PathBuf>) -> Result<Input> {
    Ok(
        if let Some(path) = path_if_some_and_not_dash(maybe_path) {
            Input::File(File::open(path)?)
        } else {
            Input::Stdin
        },
    )
}

enum Input {
    Stdin,
    File(File),
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Input::Stdin => io::stdin().read(buf),
            Input::File(ref mut file) => file.read(buf),
        }
    }
}

fn path_if_some_and_not_dash(maybe_path: &Option<PathBuf>) -> Option<&Path> {
    if let Some(ref path) = maybe_path {
        if path == Path::new("-") {
            None
        } else {
            Some(path)
        }
    } else {
        None
    }
}

fn maybe_memmap_input(input: &Input) -> Result<Option<memmap::Mmap>> {
    let in_file = match *input {
        Input::Stdin => return Ok(None),
        Input::File(ref file) => file,
    };
    let metadata = in_file.metadata()?;
    Ok(if !metadata.is_file() {
        // Not a real file.
        None
    } else if metadata.len() > isize::max_value() as u64 {
        // Too long to safely map. https://github.com/danburkert/memmap-rs/issues/69
        None
    } else if metadata.len() == 0 {
        // Mapping an empty file currently fails. https://github.com/danburkert/memmap-rs/issues/72
        None
    } else {
        // Explicitly set the length of the memory map, so that filesystem changes can't race to
        // violate the invariants we just checked.
        let map = unsafe {
            memmap::MmapOptions::new()
                .len(metadata.len() as usize)
                .map(in_file)?
        };
        Some(map)
    })
}
