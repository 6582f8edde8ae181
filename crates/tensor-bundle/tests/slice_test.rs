//! Partitioned tensors and slice reconstruction

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::tempdir;
use tensor_bundle::{
    BundleConfig, BundleError, BundleReader, BundleWriter, Extent, LocalFileSystem, Tensor,
    TensorSlice,
};

const ROWS: u64 = 6;
const COLS: u64 = 4;

fn matrix() -> Vec<f32> {
    (0..ROWS * COLS).map(|v| v as f32).collect()
}

fn rows_of(start: u64, length: u64) -> Vec<f32> {
    matrix()[(start * COLS) as usize..((start + length) * COLS) as usize].to_vec()
}

fn row_slice(start: u64, length: u64) -> TensorSlice {
    TensorSlice::new(vec![Extent::range(start, length), Extent::FULL])
}

/// Write the matrix as the given row partitions
fn write_partitions(prefix: &str, parts: &[(u64, u64)]) {
    let mut writer = BundleWriter::new(
        Arc::new(LocalFileSystem::new()),
        prefix,
        BundleConfig::default(),
    );
    for &(start, length) in parts {
        writer
            .add_slice(
                "m",
                &[ROWS, COLS],
                &row_slice(start, length),
                &Tensor::from_values(&[length, COLS], &rows_of(start, length)).unwrap(),
            )
            .unwrap();
    }
    writer.finish().unwrap();
}

fn open(prefix: &str) -> BundleReader {
    BundleReader::open(
        Arc::new(LocalFileSystem::new()),
        prefix,
        BundleConfig::default(),
    )
    .unwrap()
}

#[test]
fn test_full_value_from_partitions() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("p").to_str().unwrap().to_string();
    write_partitions(&prefix, &[(3, 3), (0, 3)]);

    let mut reader = open(&prefix);
    assert_eq!(
        reader.lookup_tensor_slices("m").unwrap(),
        vec![row_slice(3, 3), row_slice(0, 3)]
    );
    let full = reader.lookup("m").unwrap();
    assert_eq!(full.shape(), &[ROWS, COLS]);
    assert_eq!(full.to_vec::<f32>().unwrap(), matrix());

    let summary = reader.debug_string().unwrap();
    assert_eq!(summary, "m (float) [6,4]\n");
}

#[test]
fn test_region_spanning_partitions() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("p").to_str().unwrap().to_string();
    write_partitions(&prefix, &[(0, 2), (2, 2), (4, 2)]);

    let mut reader = open(&prefix);
    let request = TensorSlice::new(vec![Extent::range(1, 4), Extent::range(1, 2)]);
    let value = reader.lookup_slice("m", &request).unwrap();
    assert_eq!(value.shape(), &[4, 2]);

    let expected: Vec<f32> = (1..5)
        .flat_map(|row| [row * COLS + 1, row * COLS + 2])
        .map(|v| v as f32)
        .collect();
    assert_eq!(value.to_vec::<f32>().unwrap(), expected);
}

#[test]
fn test_exact_partition_is_read_directly() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("p").to_str().unwrap().to_string();
    write_partitions(&prefix, &[(0, 2), (2, 4)]);

    let mut reader = open(&prefix);
    let value = reader.lookup_slice("m", &row_slice(2, 4)).unwrap();
    assert_eq!(value.to_vec::<f32>().unwrap(), rows_of(2, 4));
}

#[test]
fn test_uncovered_request_fails() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("p").to_str().unwrap().to_string();
    write_partitions(&prefix, &[(0, 3)]);

    let mut reader = open(&prefix);
    assert!(matches!(
        reader.lookup("m"),
        Err(BundleError::InsufficientSlices(_))
    ));
    assert!(matches!(
        reader.lookup_slice("m", &row_slice(2, 2)),
        Err(BundleError::InsufficientSlices(_))
    ));

    // Missing coverage is not damage; covered regions stay readable
    assert!(reader.status().is_ok());
    assert_eq!(
        reader
            .lookup_slice("m", &row_slice(1, 2))
            .unwrap()
            .to_vec::<f32>()
            .unwrap(),
        rows_of(1, 2)
    );
}

#[test]
fn test_partition_shape_must_match() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("p").to_str().unwrap().to_string();
    let mut writer = BundleWriter::new(
        Arc::new(LocalFileSystem::new()),
        &prefix,
        BundleConfig::default(),
    );
    let wrong = Tensor::from_values(&[3, COLS], &rows_of(0, 3)).unwrap();
    assert!(matches!(
        writer.add_slice("m", &[ROWS, COLS], &row_slice(0, 2), &wrong),
        Err(BundleError::InvalidShape(_))
    ));
}

#[test]
fn test_indexed_rows_reject_partitioned_tensor() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("p").to_str().unwrap().to_string();
    write_partitions(&prefix, &[(0, 6)]);

    let mut reader = open(&prefix);
    // A partition covering the whole tensor is stored as a plain value
    assert!(reader.lookup_tensor_slices("m").unwrap().is_empty());
    assert_eq!(
        reader
            .lookup_with_indices("m", &[5, 0])
            .unwrap()
            .to_vec::<f32>()
            .unwrap(),
        [rows_of(5, 1), rows_of(0, 1)].concat()
    );

    let other = dir.path().join("q").to_str().unwrap().to_string();
    write_partitions(&other, &[(0, 3), (3, 3)]);
    let mut reader = open(&other);
    assert!(matches!(
        reader.lookup_with_indices("m", &[0]),
        Err(BundleError::Unimplemented(_))
    ));
}
