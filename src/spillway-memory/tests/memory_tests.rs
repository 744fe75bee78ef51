//! Integration tests for the spill catalog.

use std::sync::Arc;
use std::thread;

use arrow_array::{Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use common_config::{MemoryConfig, OomInjectionConfig};
use common_error::RetryKind;
use spillway_memory::{DeviceAllocator, SpillCatalog, StorageTier};

fn mixed_batch(rows: usize) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]));
    let ids: Vec<i64> = (0..rows as i64).collect();
    let names: Vec<Option<String>> = (0..rows)
        .map(|i| (i % 3 != 0).then(|| format!("row-{i}")))
        .collect();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(names)),
        ],
    )
    .unwrap()
}

#[test]
fn test_from_config_limits_device() {
    let config = MemoryConfig::default().with_device_limit(4096);
    let catalog = Arc::new(SpillCatalog::from_config(&config));
    assert_eq!(catalog.allocator().limit(), 4096);

    let unlimited = SpillCatalog::from_config(&MemoryConfig::default());
    assert_eq!(unlimited.allocator().limit(), 0);
}

#[test]
fn test_spilled_batch_round_trips_with_nulls() {
    let catalog = Arc::new(SpillCatalog::unlimited());
    let original = mixed_batch(50);
    let batch = catalog.add_batch(original.clone()).unwrap();

    assert!(batch.spill().unwrap());
    assert!(!batch.spill().unwrap());
    assert_eq!(batch.tier().unwrap(), StorageTier::Host);
    assert_eq!(catalog.allocator().used(), 0);

    let restored = batch.get_batch().unwrap();
    assert_eq!(*restored, original);
    assert_eq!(batch.tier().unwrap(), StorageTier::Device);
    assert_eq!(catalog.allocator().used(), batch.size_in_bytes());
    drop(restored);

    let stats = catalog.stats();
    assert_eq!(stats.spills, 1);
    assert_eq!(stats.unspills, 1);

    batch.close();
    assert_eq!(catalog.live_batches(), 0);
    assert_eq!(catalog.allocator().used(), 0);
}

#[test]
fn test_injection_config_drives_reserve() {
    let catalog = Arc::new(SpillCatalog::unlimited());
    let injection = OomInjectionConfig::parse_setting("num_ooms=2,skip=1,type=SPLIT_AND_RETRY")
        .unwrap()
        .unwrap();
    catalog.injector().arm(&injection);

    assert!(catalog.reserve(8).is_ok());
    for _ in 0..2 {
        let err = catalog.reserve(8).unwrap_err();
        assert_eq!(err.retry_kind(), Some(RetryKind::SplitAndRetry));
    }
    assert!(catalog.reserve(8).is_ok());
    assert_eq!(catalog.injector().injected_count(), 2);
}

#[test]
fn test_concurrent_batches_are_all_released() {
    let catalog = Arc::new(SpillCatalog::from_config(
        &MemoryConfig::default().with_device_limit(8 * 1024),
    ));

    thread::scope(|s| {
        for t in 0..4 {
            let catalog = Arc::clone(&catalog);
            s.spawn(move || {
                for i in 0..25 {
                    let batch = catalog.add_batch(mixed_batch(10 + t * 5 + i)).unwrap();
                    let data = batch.get_batch().unwrap();
                    assert_eq!(data.num_rows(), batch.num_rows());
                }
            });
        }
    });

    let stats = catalog.stats();
    assert_eq!(stats.added, 100);
    assert_eq!(stats.released, 100);
    assert_eq!(stats.live_batches, 0);
    assert_eq!(catalog.allocator().used(), 0);
}
