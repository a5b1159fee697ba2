mod common;

use anyhow::Result;
use ironshuffle::testing::*;
use ironshuffle::*;
use std::sync::Arc;

fn read_all<C: ironshuffle::dependency::ShuffleData>(
    cluster: &LocalCluster,
    handle: &ShuffleHandle<u32, u64, C>,
    executor: usize,
) -> Result<Vec<(u32, C)>> {
    let mut out = Vec::new();
    for p in 0..handle.dependency.num_partitions() {
        out.extend(cluster.read(handle, executor, p, p + 1)?);
    }
    Ok(out)
}

fn round_trip(dep: ShuffleDependency<u32, u64, u64>, expected: WriteStrategy) -> Result<()> {
    let cluster = common::cluster(2, ShuffleConf::default())?;
    let handle = cluster.register_shuffle(dep, 3);
    assert_eq!(handle.strategy, expected);

    let input = keyed_records(3_000, 97);
    for (map, records) in split_round_robin(&input, 3).into_iter().enumerate() {
        let status = cluster.run_map(&handle, map % 2, map, records)?;
        assert_eq!(status.num_partitions(), handle.dependency.num_partitions());
    }

    let output = read_all(&cluster, &handle, 0)?;
    assert_same_multiset(&output, &input);
    Ok(())
}

#[test]
fn bypass_round_trip() -> Result<()> {
    let dep: ShuffleDependency<u32, u64, u64> = ShuffleDependency::new(0, Arc::new(HashPartitioner::new(7)));
    round_trip(dep, WriteStrategy::Bypass)
}

#[test]
fn serialized_sort_round_trip() -> Result<()> {
    let dep: ShuffleDependency<u32, u64, u64> = ShuffleDependency::new(1, Arc::new(HashPartitioner::new(250)));
    round_trip(dep, WriteStrategy::SerializedSort)
}

#[test]
fn deserialized_sort_round_trip() -> Result<()> {
    let dep: ShuffleDependency<u32, u64, u64> = ShuffleDependency::new(2, Arc::new(HashPartitioner::new(250))).with_serializer(RecordSerializer::Json);
    round_trip(dep, WriteStrategy::DeserializedSort)
}

#[test]
fn records_land_in_their_partition() -> Result<()> {
    let cluster = common::cluster(1, ShuffleConf::default())?;
    let partitioner = Arc::new(FnPartitioner::new(4, |k: &u32| (*k % 4) as usize));
    let handle = cluster.register_shuffle(ShuffleDependency::<u32, u64, u64>::new(3, partitioner), 1);
    cluster.run_map(&handle, 0, 0, keyed_records(500, 40))?;

    for p in 0..4 {
        let records = cluster.read(&handle, 0, p, p + 1)?;
        assert!(!records.is_empty());
        assert!(records.iter().all(|(k, _)| *k as usize % 4 == p), "partition {p}");
    }
    Ok(())
}

#[test]
fn empty_map_output_reads_as_nothing() -> Result<()> {
    let cluster = common::cluster(2, ShuffleConf::default())?;
    for (id, partitions) in [(10, 5), (11, 300)] {
        let dep = ShuffleDependency::<u32, u64, u64>::new(id, Arc::new(HashPartitioner::new(partitions)));
        let handle = cluster.register_shuffle(dep, 2);
        let status = cluster.run_map(&handle, 0, 0, Vec::new())?;
        assert!((0..partitions).all(|p| status.size_for_block(p) == 0));
        cluster.run_map(&handle, 1, 1, vec![(1, 1)])?;
        let output = read_all(&cluster, &handle, 1)?;
        assert_eq!(output, vec![(1, 1)]);
    }
    Ok(())
}

#[test]
fn writer_reports_partition_lengths_and_metrics() -> Result<()> {
    let cluster = common::cluster(1, ShuffleConf::default())?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(4, Arc::new(HashPartitioner::new(6)));
    let handle = cluster.register_shuffle(dep, 1);
    let manager = cluster.manager(0)?;

    let ctx = cluster.task_context(0);
    let map_id = ctx.task_attempt_id();
    let mut writer = manager.get_writer(&handle, map_id, Arc::clone(&ctx))?;
    writer.write(&mut keyed_records(1_000, 30).into_iter().map(Ok::<_, anyhow::Error>))?;
    let lengths = writer.partition_lengths().to_vec();
    let status = writer.stop(true)?.ok_or_else(|| anyhow::anyhow!("no map status"))?;
    assert!(writer.stop(true)?.is_none());

    assert_eq!(lengths.len(), 6);
    assert_eq!(ctx.metrics().write.records_written(), 1_000);
    assert_eq!(ctx.metrics().write.bytes_written(), lengths.iter().sum::<u64>());
    assert_eq!(status.map_id(), map_id);

    let index = manager.block_resolver().read_index(4, map_id)?;
    assert_eq!(index.partition_lengths(), lengths);
    assert_eq!(index.checksums().map(<[u64]>::len), Some(6));
    Ok(())
}

#[test]
fn unregister_deletes_map_output_once() -> Result<()> {
    let cluster = common::cluster(1, ShuffleConf::default())?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(5, Arc::new(HashPartitioner::new(3)));
    let handle = cluster.register_shuffle(dep, 2);
    let a = cluster.run_map(&handle, 0, 0, keyed_records(100, 10))?;
    let b = cluster.run_map(&handle, 0, 1, keyed_records(100, 10))?;

    let manager = cluster.manager(0)?;
    let resolver = manager.block_resolver();
    for status in [&a, &b] {
        assert!(resolver.data_file(5, status.map_id())?.exists());
        assert!(resolver.index_file(5, status.map_id())?.exists());
    }

    assert!(manager.unregister_shuffle(5));
    for status in [&a, &b] {
        assert!(!resolver.data_file(5, status.map_id())?.exists());
        assert!(!resolver.index_file(5, status.map_id())?.exists());
        assert!(!resolver.checksum_file(5, status.map_id())?.exists());
    }
    assert!(!manager.unregister_shuffle(5));
    assert!(!manager.unregister_shuffle(404));
    Ok(())
}

#[test]
fn rejects_an_invalid_reduce_range() -> Result<()> {
    let cluster = common::cluster(1, ShuffleConf::default())?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(6, Arc::new(HashPartitioner::new(3)));
    let handle = cluster.register_shuffle(dep, 1);
    let manager = cluster.manager(0)?;
    assert!(manager.get_reader(&handle, 2, 2, cluster.task_context(0)).is_err());
    assert!(manager.get_reader(&handle, 0, 4, cluster.task_context(0)).is_err());
    Ok(())
}

#[test]
fn reading_before_all_maps_finish_is_a_metadata_failure() -> Result<()> {
    let cluster = common::cluster(1, ShuffleConf::default())?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(7, Arc::new(HashPartitioner::new(2)));
    let handle = cluster.register_shuffle(dep, 2);
    cluster.run_map(&handle, 0, 0, keyed_records(10, 5))?;

    let err = cluster.read(&handle, 0, 0, 1).err().ok_or_else(|| anyhow::anyhow!("read succeeded"))?;
    assert!(is_fetch_failure(&err), "{err:#}");
    assert!(matches!(
        err.downcast_ref::<ShuffleError>(),
        Some(ShuffleError::MetadataFetchFailed { shuffle_id: 7, .. })
    ));
    Ok(())
}

#[test]
fn conf_from_pairs_drives_strategy_selection() -> Result<()> {
    let conf = ShuffleConf::from_pairs([("shuffle.sort.bypassMergeThreshold", "2")])?;
    let cluster = common::cluster(1, conf)?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(8, Arc::new(HashPartitioner::new(3)));
    let handle = cluster.register_shuffle(dep, 1);
    assert_eq!(handle.strategy, WriteStrategy::SerializedSort);
    Ok(())
}

/// Two local dirs, the second in memory-backed `/dev/shm` when the host has it,
/// so spill files and data files can land on different filesystems.
fn local_dirs_on_separate_disks() -> Result<Vec<tempfile::TempDir>> {
    let mut dirs = vec![tempfile::tempdir()?];
    let second = match tempfile::tempdir_in("/dev/shm") {
        Ok(dir) => dir,
        Err(_) => tempfile::tempdir()?,
    };
    dirs.push(second);
    Ok(dirs)
}

#[test]
fn map_outputs_commit_across_local_dirs() -> Result<()> {
    use ironshuffle::fetch::{BlockTransport, LocalClusterTransport, LocalMapOutputTracker, MapOutputTracker};

    common::init_logging();
    let dirs = local_dirs_on_separate_disks()?;
    let local_dirs = dirs.iter().map(|d| d.path().to_path_buf()).collect();
    let tracker = Arc::new(LocalMapOutputTracker::new());
    let transport = Arc::new(LocalClusterTransport::new());
    let address = BlockManagerId::new("exec-0", "localhost", 7000);
    let manager = SortShuffleManager::new(
        ShuffleConf { local_dirs, ..ShuffleConf::default() },
        address.clone(),
        Arc::clone(&transport) as Arc<dyn BlockTransport>,
        Arc::clone(&tracker) as Arc<dyn MapOutputTracker>,
    )?;
    transport.register_executor(address, Arc::clone(manager.block_resolver()));

    let dep = ShuffleDependency::<u32, u64, u64>::new(12, Arc::new(HashPartitioner::new(250)));
    tracker.register_shuffle(12, 8);
    let handle = manager.register_shuffle(dep, 8);
    assert_eq!(handle.strategy, WriteStrategy::SerializedSort);

    let input = keyed_records(400, 90);
    for (map, records) in split_round_robin(&input, 8).into_iter().enumerate() {
        let ctx = TaskContext::standalone(map);
        let mut writer = manager.get_writer(&handle, ctx.task_attempt_id(), Arc::clone(&ctx))?;
        writer.write(&mut records.into_iter().map(Ok::<_, anyhow::Error>))?;
        let status = writer.stop(true)?.ok_or_else(|| anyhow::anyhow!("map {map} produced no status"))?;
        tracker.register_map_output(12, map, status)?;
    }
    assert_eq!(tracker.num_available_outputs(12), 8);

    let mut output = Vec::new();
    for p in 0..250 {
        let reader = manager.get_reader(&handle, p, p + 1, TaskContext::standalone(p))?;
        output.extend(reader.read()?.collect::<Result<Vec<_>>>()?);
    }
    assert_same_multiset(&output, &input);
    assert!(manager.block_resolver().disk().temp_files()?.is_empty());
    Ok(())
}
