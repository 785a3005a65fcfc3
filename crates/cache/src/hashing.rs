//! Streaming content hashing for blobs and signature stamps

use kiln_core::{Digest, DigestBuilder};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

const BUFFER_SIZE: usize = 64 * 1024;

/// SHA-256 of a file's bytes together with the number of bytes read
pub fn hash_file(path: &Path) -> io::Result<(Digest, u64)> {
    let file = File::open(path)?;
    hash_reader(file)
}

pub fn hash_reader<R: Read>(reader: R) -> io::Result<(Digest, u64)> {
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, reader);
    let mut builder = DigestBuilder::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        builder.update_raw(&buffer[..read]);
        total += read as u64;
    }
    Ok((builder.finish(), total))
}
