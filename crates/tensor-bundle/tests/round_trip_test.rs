//! Round trips through a committed bundle

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};
use tensor_bundle::{
    BundleConfig, BundleError, BundleReader, BundleWriter, DataType, ElementKind, Endianness,
    LocalFileSystem, Tensor,
};

fn prefix_in(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

fn writer(prefix: &str, config: BundleConfig) -> BundleWriter {
    BundleWriter::new(Arc::new(LocalFileSystem::new()), prefix, config)
}

fn reader(prefix: &str) -> BundleReader {
    BundleReader::open(
        Arc::new(LocalFileSystem::new()),
        prefix,
        BundleConfig::default(),
    )
    .unwrap()
}

fn foreign_order() -> Endianness {
    match Endianness::host() {
        Endianness::Little => Endianness::Big,
        Endianness::Big => Endianness::Little,
    }
}

/// One sample value per element type
fn sample(dtype: DataType) -> Tensor {
    let shape = [3u64, 2];
    match dtype.kind() {
        ElementKind::Fixed { width, .. } => {
            let bytes = (0..6 * width).map(|i| (i * 37 % 251) as u8).collect();
            Tensor::from_bytes(dtype, &shape, bytes).unwrap()
        }
        ElementKind::String => Tensor::from_strings(
            &shape,
            vec![
                b"".to_vec(),
                b"a".to_vec(),
                b"checkpoint".to_vec(),
                vec![0u8; 300],
                b"\xff\x00".to_vec(),
                b"z".to_vec(),
            ],
        )
        .unwrap(),
        ElementKind::Variant => {
            Tensor::from_variants(&shape, (0..6u8).map(|i| vec![i; i as usize]).collect()).unwrap()
        }
    }
}

fn key_for(dtype: DataType) -> String {
    format!("values/{dtype}")
}

#[test]
fn test_every_type_round_trips() {
    let dir = tempdir().unwrap();
    let prefix = prefix_in(&dir, "ckpt/all");

    let mut w = writer(&prefix, BundleConfig::default());
    for dtype in DataType::ALL {
        w.add(&key_for(dtype), &sample(dtype)).unwrap();
    }
    w.finish().unwrap();

    let mut r = reader(&prefix);
    for dtype in DataType::ALL {
        let value = r.lookup(&key_for(dtype)).unwrap();
        assert_eq!(value, sample(dtype), "{dtype}");
    }
    assert!(r.status().is_ok());
}

#[test]
fn test_aligned_offsets() {
    let dir = tempdir().unwrap();
    let prefix = prefix_in(&dir, "aligned");

    let mut w = writer(&prefix, BundleConfig::default().with_alignment(64));
    w.add("a", &Tensor::from_values(&[3], &[1u8, 2, 3]).unwrap())
        .unwrap();
    w.add("b", &Tensor::from_values(&[2], &[1.5f64, -2.0]).unwrap())
        .unwrap();
    w.finish().unwrap();

    let mut r = reader(&prefix);
    let (_, offset, size) = r.tensor_location("b").unwrap();
    assert_eq!((offset, size), (64, 16));
    assert_eq!(
        r.lookup("b").unwrap().to_vec::<f64>().unwrap(),
        vec![1.5, -2.0]
    );
}

#[test]
fn test_foreign_byte_order_round_trips() {
    let dir = tempdir().unwrap();
    let prefix = prefix_in(&dir, "foreign");

    let mut w = writer(
        &prefix,
        BundleConfig::default().with_byte_order(foreign_order()),
    );
    for dtype in DataType::ALL {
        if dtype != DataType::Variant {
            w.add(&key_for(dtype), &sample(dtype)).unwrap();
        }
    }
    w.add(
        "complex",
        &Tensor::from_values(&[4], &[1.0f32, 2.0, 3.0, 4.0])
            .map(|t| t.into_bytes().unwrap())
            .and_then(|bytes| Tensor::from_bytes(DataType::Complex64, &[2], bytes))
            .unwrap(),
    )
    .unwrap();
    w.add("opaque", &sample(DataType::Variant)).unwrap();
    w.finish().unwrap();

    let mut r = reader(&prefix);
    assert!(r.needs_swap());
    assert_eq!(r.header().endianness, foreign_order());
    for dtype in DataType::ALL {
        if dtype != DataType::Variant {
            assert_eq!(r.lookup(&key_for(dtype)).unwrap(), sample(dtype), "{dtype}");
        }
    }

    // Each component of a complex value is swapped on its own
    let complex = r.lookup("complex").unwrap();
    let components: Vec<f32> = complex
        .as_bytes()
        .unwrap()
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(components, vec![1.0, 2.0, 3.0, 4.0]);

    assert!(matches!(
        r.lookup("opaque"),
        Err(BundleError::Unimplemented(_))
    ));
}

#[test]
fn test_chunked_write_round_trips() {
    let dir = tempdir().unwrap();
    let prefix = prefix_in(&dir, "chunked");
    let values: Vec<i64> = (0..100).collect();
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();

    let mut w = writer(
        &prefix,
        BundleConfig::default()
            .with_write_buffer_size(48)
            .with_byte_order(foreign_order()),
    );
    w.add("before", &Tensor::from_values(&[1], &[7i32]).unwrap())
        .unwrap();
    w.begin_write_chunk("big", DataType::Int64, &[10, 10]).unwrap();
    for chunk in bytes.chunks(160) {
        w.write_chunk(chunk).unwrap();
    }
    w.end_write_chunk(800, 160).unwrap();
    w.add("after", &Tensor::from_values(&[1], &[9i32]).unwrap())
        .unwrap();
    w.finish().unwrap();

    let mut r = reader(&prefix);
    assert_eq!(r.lookup("big").unwrap().to_vec::<i64>().unwrap(), values);
    assert_eq!(r.lookup("after").unwrap().to_vec::<i32>().unwrap(), vec![9]);
}

#[test]
fn test_empty_bundle() {
    let dir = tempdir().unwrap();
    let prefix = prefix_in(&dir, "empty");
    writer(&prefix, BundleConfig::default()).finish().unwrap();

    let mut r = reader(&prefix);
    assert_eq!(r.debug_string().unwrap(), "");
    assert!(!r.contains("anything"));
}

#[test]
fn test_config_serializes() {
    let config = BundleConfig::default()
        .with_alignment(8)
        .with_byte_order(Endianness::Big);
    let json = serde_json::to_string(&config).unwrap();
    let parsed: BundleConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, config);
}
