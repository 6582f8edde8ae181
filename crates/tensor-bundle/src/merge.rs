//! Combine bundles written by independent workers
//!
//! Shards of input bundle `i` are renumbered after the shards of every
//! earlier input, so merged shard ids are contiguous and follow input
//! order. Partitioned tensors may appear in several inputs; their slice
//! lists are concatenated. Whole values must be unique across inputs.
//!
//! Hash-table tensors are written with rows keyed by hash range. After the
//! catalogs are merged their slices are renumbered into one contiguous row
//! space, ascending by hash range, and their payload keys renamed to match.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rayon::ThreadPool;
use tracing::{debug, info, warn};

use crate::entry::{BundleEntry, BundleHeader, EntryCatalog};
use crate::fs::{self, FileSystem};
use crate::slice::{Extent, TensorSlice, slice_key};
use crate::table::{Table, TableBuilder};
use crate::{
    BundleError, HEADER_ENTRY_KEY, Result, data_filename, metadata_filename, temp_filename,
};

/// Shard file move from an input bundle into the merged bundle
#[derive(Debug, Clone)]
struct Relocation {
    from: String,
    to: String,
}

/// Merge the bundles under `prefixes` into one bundle under `merged_prefix`.
///
/// Shard files are moved, not copied. When `pool` is given the moves run on
/// it in parallel; the first failure is reported once all of them finished.
/// The inputs' metadata tables are deleted after the merged table is
/// committed.
pub fn merge_bundles(
    fs: Arc<dyn FileSystem>,
    prefixes: &[&str],
    merged_prefix: &str,
    pool: Option<&ThreadPool>,
) -> Result<()> {
    let Some(first) = prefixes.first() else {
        return Err(BundleError::InvalidArgument(
            "merge needs at least one bundle".to_string(),
        ));
    };

    let mut catalog = EntryCatalog::new();
    let mut relocations = Vec::new();
    let mut merged_header: Option<BundleHeader> = None;
    let mut shard_count = 0u32;

    for prefix in prefixes {
        let (header, entries) = read_catalog(fs.as_ref(), prefix)?;
        if let Some(expected) = &merged_header {
            if header.endianness != expected.endianness {
                return Err(BundleError::IncompatibleBundles(format!(
                    "{prefix} is {:?} endian, {first} is {:?}",
                    header.endianness, expected.endianness
                )));
            }
            if header.version != expected.version {
                return Err(BundleError::IncompatibleBundles(format!(
                    "{prefix} has version {:?}, {first} has {:?}",
                    header.version, expected.version
                )));
            }
        } else {
            merged_header = Some(header.clone());
        }

        let base = shard_count;
        shard_count = shard_count.checked_add(header.shard_count).ok_or_else(|| {
            BundleError::InvalidArgument("merged shard count overflows".to_string())
        })?;
        for shard_id in 0..header.shard_count {
            relocations.push((
                data_filename(prefix, shard_id, header.shard_count),
                base + shard_id,
            ));
        }

        let mut added = 0usize;
        for (key, mut entry) in entries {
            if entry.shard_id >= header.shard_count {
                return Err(BundleError::CorruptBundle(format!(
                    "'{key}' in {prefix} points at shard {} of {}",
                    entry.shard_id, header.shard_count
                )));
            }
            entry.shard_id += base;
            merge_entry(&mut catalog, key, entry)?;
            added += 1;
        }
        debug!("Merged {added} entries from {prefix}");
    }

    fix_hash_tables(&mut catalog)?;

    let relocations: Vec<Relocation> = relocations
        .into_iter()
        .map(|(from, shard_id)| Relocation {
            from,
            to: data_filename(merged_prefix, shard_id, shard_count),
        })
        .collect();
    if let Some(dir) = fs::dirname(merged_prefix) {
        fs.create_dir(dir)?;
    }
    match pool {
        Some(pool) => relocate_parallel(fs.as_ref(), &relocations, pool)?,
        None => {
            for relocation in &relocations {
                relocate(fs.as_ref(), relocation)?;
            }
        }
    }

    let mut header = merged_header.ok_or_else(|| {
        BundleError::InvalidArgument("merge needs at least one bundle".to_string())
    })?;
    header.shard_count = shard_count;
    write_merged_table(fs.as_ref(), merged_prefix, &catalog, &header)?;
    info!(
        "Merged {} bundles into {merged_prefix}: {} entries, {shard_count} shards",
        prefixes.len(),
        catalog.len()
    );

    let merged_metadata = metadata_filename(merged_prefix);
    for prefix in prefixes {
        let path = metadata_filename(prefix);
        if path == merged_metadata {
            continue;
        }
        if let Err(e) = fs.delete_file(&path) {
            warn!("Failed to delete merged metadata {path}: {e}");
        }
    }
    Ok(())
}

/// Header and every entry of one bundle's metadata table
fn read_catalog(
    fs: &dyn FileSystem,
    prefix: &str,
) -> Result<(BundleHeader, Vec<(String, BundleEntry)>)> {
    let path = metadata_filename(prefix);
    let size = fs.file_size(&path)?;
    let mut file = fs.open_random_access(&path)?;
    let mut iter = Table::open(file.as_mut(), size)?.iter();

    iter.seek(HEADER_ENTRY_KEY);
    if !iter.valid() || iter.key() != HEADER_ENTRY_KEY {
        return Err(BundleError::CorruptHeader(format!(
            "{path}: failed to seek to header entry"
        )));
    }
    let header = BundleHeader::decode(iter.value())
        .map_err(|e| BundleError::CorruptHeader(format!("{path}: {e}")))?;
    header.version.check_supported()?;

    let mut entries = Vec::new();
    iter.next();
    while iter.valid() {
        entries.push((
            iter.key().to_string(),
            BundleEntry::decode(iter.key(), iter.value())?,
        ));
        iter.next();
    }
    Ok((header, entries))
}

fn merge_entry(catalog: &mut EntryCatalog, key: String, incoming: BundleEntry) -> Result<()> {
    let Some(existing) = catalog.get_mut(&key) else {
        catalog.insert(key, incoming);
        return Ok(());
    };
    match (existing.is_sliced(), incoming.is_sliced()) {
        (false, false) => Err(BundleError::DuplicateKey(key)),
        (true, false) | (false, true) => Err(BundleError::IncompatibleEntry(format!(
            "'{key}' is partitioned in one bundle and whole in another"
        ))),
        (true, true) => {
            if existing.dtype != incoming.dtype || existing.shape != incoming.shape {
                return Err(BundleError::IncompatibleEntry(format!(
                    "'{key}' is {} {:?} in one bundle and {} {:?} in another",
                    existing.dtype, existing.shape, incoming.dtype, incoming.shape
                )));
            }
            existing.slices.extend(incoming.slices);
            existing.is_hash_table |= incoming.is_hash_table;
            Ok(())
        }
    }
}

/// Renumber the slices of every hash-table tensor into contiguous rows
fn fix_hash_tables(catalog: &mut EntryCatalog) -> Result<()> {
    let keys: Vec<String> = catalog
        .iter()
        .filter(|(_, entry)| entry.is_hash_table)
        .map(|(key, _)| key.clone())
        .collect();

    for key in keys {
        let Some(entry) = catalog.get_mut(&key) else {
            continue;
        };
        // Old payload key to new payload key; `None` drops the payload
        let mut renames: BTreeMap<String, Option<String>> = BTreeMap::new();
        let mut slices = std::mem::take(&mut entry.slices);
        slices.sort_by_key(|slice| slice.hash_range().map_or(0, |range| range.begin));

        let mut rows = 0u64;
        let mut kept = Vec::with_capacity(slices.len());
        for mut slice in slices {
            let range = slice.hash_range().ok_or_else(|| {
                BundleError::CorruptBundle(format!(
                    "hash-table slice {slice} of '{key}' has no hash range"
                ))
            })?;
            let length = slice
                .extents()
                .first()
                .and_then(|extent| extent.length)
                .ok_or_else(|| {
                    BundleError::CorruptBundle(format!(
                        "hash-table slice {slice} of '{key}' has no row count"
                    ))
                })?;
            let old = slice_key(&key, &TensorSlice::from_ranges(&[(range.begin, range.length)]));

            let new = if length == 0 {
                info!("Dropping empty hash-table slice {slice} of '{key}'");
                None
            } else {
                if let Some(extent) = slice.extent_mut(0) {
                    *extent = Extent::range(rows, length);
                }
                rows += length;
                let new = slice_key(&key, &slice);
                kept.push(slice);
                Some(new)
            };
            if renames.insert(old.clone(), new).is_some() {
                return Err(BundleError::MergeFixupConflict(format!(
                    "two slices of '{key}' share payload key {old:?}"
                )));
            }
        }

        let Some(first_dim) = entry.shape.first_mut() else {
            return Err(BundleError::CorruptBundle(format!(
                "hash-table tensor '{key}' has no rows dimension"
            )));
        };
        *first_dim = rows;
        entry.slices = kept;
        debug!("Renumbered hash table '{key}' into {rows} rows");

        rename_payloads(catalog, &key, renames)?;
    }
    Ok(())
}

fn rename_payloads(
    catalog: &mut EntryCatalog,
    key: &str,
    renames: BTreeMap<String, Option<String>>,
) -> Result<()> {
    // Take every old payload out first; an old key may be another slice's
    // new key
    let mut moved = Vec::with_capacity(renames.len());
    for (old, new) in renames {
        let payload = catalog.remove(&old).ok_or_else(|| {
            BundleError::CorruptBundle(format!("hash-table payload {old:?} of '{key}' is missing"))
        })?;
        if let Some(new) = new {
            moved.push((new, payload));
        }
    }
    for (new, payload) in moved {
        if catalog.contains(&new) {
            return Err(BundleError::MergeFixupConflict(format!(
                "renumbered payload key {new:?} of '{key}' is already taken"
            )));
        }
        catalog.insert(new, payload);
    }
    Ok(())
}

fn relocate(fs: &dyn FileSystem, relocation: &Relocation) -> Result<()> {
    fs.rename(&relocation.from, &relocation.to)?;
    debug!("Relocated {} to {}", relocation.from, relocation.to);
    Ok(())
}

fn relocate_parallel(
    fs: &dyn FileSystem,
    relocations: &[Relocation],
    pool: &ThreadPool,
) -> Result<()> {
    let first_error: Mutex<Option<BundleError>> = Mutex::new(None);
    let completed = AtomicUsize::new(0);

    pool.scope(|scope| {
        for relocation in relocations {
            let first_error = &first_error;
            let completed = &completed;
            scope.spawn(move |_| {
                if let Err(e) = relocate(fs, relocation) {
                    let mut slot = first_error.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
                completed.fetch_add(1, Ordering::Relaxed);
            });
        }
    });

    debug!(
        "{} of {} relocations finished",
        completed.load(Ordering::Relaxed),
        relocations.len()
    );
    match first_error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn write_merged_table(
    fs: &dyn FileSystem,
    merged_prefix: &str,
    catalog: &EntryCatalog,
    header: &BundleHeader,
) -> Result<()> {
    let path = metadata_filename(merged_prefix);
    let temp = temp_filename(&path);
    let written = fs
        .open_writable(&temp)
        .and_then(|file| catalog.write_table(TableBuilder::new(file), header))
        .and_then(|_| fs.rename(&temp, &path));
    if let Err(e) = written {
        if fs.exists(&temp)
            && let Err(cleanup) = fs.delete_file(&temp)
        {
            warn!("Failed to delete temporary file {temp}: {cleanup}");
        }
        return Err(e);
    }
    debug!("Renamed {temp} to {path}");
    Ok(())
}
