//! Merging bundles from independent writers

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};
use tensor_bundle::{
    BundleConfig, BundleError, BundleReader, BundleWriter, Endianness, Extent, FileSystem,
    HashRange, LocalFileSystem, Tensor, TensorSlice, data_filename, merge_bundles,
    metadata_filename,
};

fn fs() -> Arc<dyn FileSystem> {
    Arc::new(LocalFileSystem::new())
}

fn prefix_in(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

fn write(prefix: &str, values: &[(&str, &[i32])]) {
    let mut writer = BundleWriter::new(fs(), prefix, BundleConfig::default());
    for (key, data) in values {
        writer
            .add(key, &Tensor::from_values(&[data.len() as u64], data).unwrap())
            .unwrap();
    }
    writer.finish().unwrap();
}

fn open(prefix: &str) -> BundleReader {
    BundleReader::open(fs(), prefix, BundleConfig::default()).unwrap()
}

fn read_i32(reader: &mut BundleReader, key: &str) -> Vec<i32> {
    reader.lookup(key).unwrap().to_vec::<i32>().unwrap()
}

#[test]
fn test_disjoint_bundles_merge() {
    let dir = tempdir().unwrap();
    let a = prefix_in(&dir, "worker0/ckpt");
    let b = prefix_in(&dir, "worker1/ckpt");
    let merged = prefix_in(&dir, "merged/ckpt");
    write(&a, &[("key1", &[1, 2, 3])]);
    write(&b, &[("key2", &[4, 5])]);

    merge_bundles(fs(), &[a.as_str(), b.as_str()], &merged, None).unwrap();

    let mut reader = open(&merged);
    assert_eq!(reader.shard_count(), 2);
    assert_eq!(read_i32(&mut reader, "key1"), vec![1, 2, 3]);
    assert_eq!(read_i32(&mut reader, "key2"), vec![4, 5]);

    let (path1, _, _) = reader.tensor_location("key1").unwrap();
    let (path2, _, _) = reader.tensor_location("key2").unwrap();
    assert_eq!(path1, data_filename(&merged, 0, 2));
    assert_eq!(path2, data_filename(&merged, 1, 2));

    // Inputs' metadata is gone and their shards were moved
    assert!(!Path::new(&metadata_filename(&a)).exists());
    assert!(!Path::new(&metadata_filename(&b)).exists());
    assert!(!Path::new(&data_filename(&a, 0, 1)).exists());
}

#[test]
fn test_duplicate_whole_values_rejected() {
    let dir = tempdir().unwrap();
    let a = prefix_in(&dir, "a");
    let b = prefix_in(&dir, "b");
    write(&a, &[("key1", &[1])]);
    write(&b, &[("key1", &[2])]);

    assert!(matches!(
        merge_bundles(fs(), &[a.as_str(), b.as_str()], &prefix_in(&dir, "m"), None),
        Err(BundleError::DuplicateKey(_))
    ));
    // Nothing was committed or moved
    assert!(Path::new(&metadata_filename(&a)).exists());
    assert!(Path::new(&data_filename(&b, 0, 1)).exists());
}

#[test]
fn test_partitions_from_several_workers() {
    let dir = tempdir().unwrap();
    let a = prefix_in(&dir, "a");
    let b = prefix_in(&dir, "b");
    let merged = prefix_in(&dir, "m");
    let full: Vec<f32> = (0..12).map(|v| v as f32).collect();

    for (prefix, start) in [(&a, 0u64), (&b, 3)] {
        let mut writer = BundleWriter::new(fs(), prefix, BundleConfig::default());
        let rows = &full[(start * 2) as usize..((start + 3) * 2) as usize];
        writer
            .add_slice(
                "w",
                &[6, 2],
                &TensorSlice::new(vec![Extent::range(start, 3), Extent::FULL]),
                &Tensor::from_values(&[3, 2], rows).unwrap(),
            )
            .unwrap();
        writer.finish().unwrap();
    }

    merge_bundles(fs(), &[a.as_str(), b.as_str()], &merged, None).unwrap();
    let mut reader = open(&merged);
    assert_eq!(reader.lookup_tensor_slices("w").unwrap().len(), 2);
    assert_eq!(reader.lookup("w").unwrap().to_vec::<f32>().unwrap(), full);
}

#[test]
fn test_hash_tables_renumbered() {
    let dir = tempdir().unwrap();
    let a = prefix_in(&dir, "a");
    let b = prefix_in(&dir, "b");
    let merged = prefix_in(&dir, "m");

    // Worker a holds hash rows [500, 502), worker b rows [100, 103) and an
    // empty range
    let parts: [(&String, u64, Vec<f32>); 3] = [
        (&a, 500, vec![5.0, 5.5, 6.0, 6.5]),
        (&b, 100, vec![1.0, 1.5, 2.0, 2.5, 3.0, 3.5]),
        (&b, 900, vec![]),
    ];
    let mut writers = [
        BundleWriter::new(fs(), &a, BundleConfig::default()),
        BundleWriter::new(fs(), &b, BundleConfig::default()),
    ];
    for (prefix, begin, values) in &parts {
        let rows = values.len() as u64 / 2;
        let writer = &mut writers[usize::from(*prefix == &b)];
        writer
            .add_hash_slice(
                "emb",
                &[1 << 20, 2],
                &TensorSlice::new(vec![Extent::range(0, rows), Extent::FULL])
                    .with_hash_range(HashRange {
                        begin: *begin,
                        length: rows,
                    }),
                &Tensor::from_values(&[rows, 2], values).unwrap(),
            )
            .unwrap();
    }
    for writer in &mut writers {
        writer.finish().unwrap();
    }

    merge_bundles(fs(), &[a.as_str(), b.as_str()], &merged, None).unwrap();

    let mut reader = open(&merged);
    assert_eq!(reader.lookup_tensor_shape("emb").unwrap(), vec![5, 2]);
    let slices = reader.lookup_tensor_slices("emb").unwrap();
    let extents: Vec<Extent> = slices.iter().map(|s| s.extents()[0]).collect();
    assert_eq!(extents, vec![Extent::range(0, 3), Extent::range(3, 2)]);

    // Rows now run in ascending hash order
    assert_eq!(
        reader.lookup("emb").unwrap().to_vec::<f32>().unwrap(),
        vec![1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 5.0, 5.5, 6.0, 6.5]
    );
    assert_eq!(reader.debug_string().unwrap(), "emb (float) [5,2]\n");
}

#[test]
fn test_parallel_relocation() {
    let dir = tempdir().unwrap();
    let prefixes: Vec<String> = (0..8)
        .map(|i| prefix_in(&dir, &format!("w{i}/ckpt")))
        .collect();
    for (i, prefix) in prefixes.iter().enumerate() {
        let key = format!("shard{i}");
        write(prefix, &[(key.as_str(), &[i as i32; 3])]);
    }
    let merged = prefix_in(&dir, "merged/ckpt");
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(4)
        .build()
        .unwrap();

    let refs: Vec<&str> = prefixes.iter().map(String::as_str).collect();
    merge_bundles(fs(), &refs, &merged, Some(&pool)).unwrap();

    let mut reader = open(&merged);
    assert_eq!(reader.shard_count(), 8);
    for i in 0..8 {
        assert_eq!(read_i32(&mut reader, &format!("shard{i}")), vec![i; 3]);
    }
}

#[test]
fn test_parallel_relocation_reports_failure() {
    let dir = tempdir().unwrap();
    let a = prefix_in(&dir, "a");
    let b = prefix_in(&dir, "b");
    write(&a, &[("x", &[1])]);
    write(&b, &[("y", &[2])]);
    std::fs::remove_file(data_filename(&b, 0, 1)).unwrap();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(2)
        .build()
        .unwrap();
    let merged = prefix_in(&dir, "m");
    assert!(matches!(
        merge_bundles(fs(), &[a.as_str(), b.as_str()], &merged, Some(&pool)),
        Err(BundleError::Io(_))
    ));
    assert!(!Path::new(&metadata_filename(&merged)).exists());
    // Relocations that could run still ran
    assert!(Path::new(&data_filename(&merged, 0, 2)).exists());
}

#[test]
fn test_mixed_byte_orders_rejected() {
    let dir = tempdir().unwrap();
    let a = prefix_in(&dir, "a");
    let b = prefix_in(&dir, "b");
    write(&a, &[("x", &[1])]);

    let foreign = match Endianness::host() {
        Endianness::Little => Endianness::Big,
        Endianness::Big => Endianness::Little,
    };
    let mut writer = BundleWriter::new(fs(), &b, BundleConfig::default().with_byte_order(foreign));
    writer
        .add("y", &Tensor::from_values(&[1], &[2i32]).unwrap())
        .unwrap();
    writer.finish().unwrap();

    assert!(matches!(
        merge_bundles(fs(), &[a.as_str(), b.as_str()], &prefix_in(&dir, "m"), None),
        Err(BundleError::IncompatibleBundles(_))
    ));
}

#[test]
fn test_merge_needs_inputs() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        merge_bundles(fs(), &[], &prefix_in(&dir, "m"), None),
        Err(BundleError::InvalidArgument(_))
    ));
}
