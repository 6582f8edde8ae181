#![allow(clippy::expect_used)]

//! Dump the catalog of a committed bundle and verify every value.
//!
//! Usage:
//!   cargo run --example dump_bundle -p tensor-bundle -- /path/to/ckpt/model

use std::sync::Arc;

use tensor_bundle::{BundleConfig, BundleReader, LocalFileSystem};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let prefix = std::env::args()
        .nth(1)
        .expect("usage: dump_bundle <prefix>");
    let mut reader = BundleReader::open(
        Arc::new(LocalFileSystem::new()),
        &prefix,
        BundleConfig::default(),
    )
    .expect("failed to open bundle");

    let header = reader.header().clone();
    println!(
        "Bundle {prefix}: {} shard(s), {:?} endian, producer {}\n",
        header.shard_count, header.endianness, header.version.producer
    );
    print!("{}", reader.debug_string().expect("failed to list tensors"));

    // Verification pass over every logical tensor
    println!("\n=== Verification ===");
    let mut pass = 0u32;
    let mut fail = 0u32;
    reader.seek_to_header();
    reader.next();
    let mut keys = Vec::new();
    while reader.valid() {
        if !tensor_bundle::slice::is_slice_key(reader.key()) {
            keys.push(reader.key().to_string());
        }
        reader.next();
    }
    for key in &keys {
        match reader.lookup(key) {
            Ok(value) => {
                pass += 1;
                println!("  ok   {key}: {} elements", value.num_elements());
            }
            Err(e) => {
                fail += 1;
                println!("  FAIL {key}: {e}");
            }
        }
    }
    println!("\n{pass} passed, {fail} failed");
}
