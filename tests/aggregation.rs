mod common;

use anyhow::Result;
use ironshuffle::testing::*;
use ironshuffle::*;
use ironshuffle::dependency::ShuffleData;
use std::collections::HashMap;
use std::sync::Arc;

fn summing(shuffle_id: u32, partitions: usize, map_side_combine: bool) -> ShuffleDependency<u32, u64, u64> {
    ShuffleDependency::with_aggregator(
        shuffle_id,
        Arc::new(HashPartitioner::new(partitions)),
        Arc::new(Sum::<u64>::new()),
        map_side_combine,
    )
}

fn read_sorted_by_key<V: ShuffleData, C: ShuffleData>(
    cluster: &LocalCluster,
    handle: &ShuffleHandle<u32, V, C>,
    executor: usize,
) -> Result<Vec<(u32, C)>> {
    let mut out = Vec::new();
    for p in 0..handle.dependency.num_partitions() {
        out.extend(cluster.read(handle, executor, p, p + 1)?);
    }
    out.sort_by_key(|(k, _)| *k);
    Ok(out)
}

#[test]
fn map_side_combine_writes_one_record_per_key() -> Result<()> {
    let cluster = common::cluster(1, ShuffleConf::default())?;
    let handle = cluster.register_shuffle(summing(0, 2, true), 1);
    assert_eq!(handle.strategy, WriteStrategy::DeserializedSort);

    let ctx = cluster.task_context(0);
    let mut writer = cluster.manager(0)?.get_writer(&handle, ctx.task_attempt_id(), Arc::clone(&ctx))?;
    let input = vec![(1u32, 1u64), (1, 2), (2, 5)];
    writer.write(&mut input.into_iter().map(Ok::<_, anyhow::Error>))?;
    let status = writer.stop(true)?.ok_or_else(|| anyhow::anyhow!("no map status"))?;
    assert_eq!(ctx.metrics().write.records_written(), 2);
    cluster.tracker().register_map_output(0, 0, status)?;

    assert_eq!(read_sorted_by_key(&cluster, &handle, 0)?, vec![(1, 3), (2, 5)]);
    Ok(())
}

#[test]
fn reduce_side_merges_partial_sums() -> Result<()> {
    let cluster = common::cluster(3, ShuffleConf::default())?;
    let handle = cluster.register_shuffle(summing(1, 5, true), 4);

    let input = keyed_records(4_000, 61);
    for (map, records) in split_round_robin(&input, 4).into_iter().enumerate() {
        cluster.run_map(&handle, map % 3, map, records)?;
    }
    assert_eq!(read_sorted_by_key(&cluster, &handle, 2)?, expected_sums(&input));
    Ok(())
}

#[test]
fn reduce_side_only_aggregation() -> Result<()> {
    let cluster = common::cluster(2, ShuffleConf::default())?;
    let handle = cluster.register_shuffle(summing(2, 5, false), 3);
    assert_eq!(handle.strategy, WriteStrategy::Bypass);

    let input = keyed_records(2_000, 33);
    for (map, records) in split_round_robin(&input, 3).into_iter().enumerate() {
        cluster.run_map(&handle, map % 2, map, records)?;
    }
    assert_eq!(read_sorted_by_key(&cluster, &handle, 1)?, expected_sums(&input));
    Ok(())
}

#[test]
fn word_count_is_ordered_within_each_partition() -> Result<()> {
    let cluster = common::cluster(2, ShuffleConf::default())?;
    let dep = ShuffleDependency::<String, u64, u64>::with_aggregator(
        3,
        Arc::new(HashPartitioner::new(3)),
        Arc::new(Count),
        true,
    )
    .with_key_ordering(natural_order::<String>());
    let handle = cluster.register_shuffle(dep, 2);

    let words = word_pairs();
    for (map, records) in split_round_robin(&words, 2).into_iter().enumerate() {
        cluster.run_map(&handle, map, map, records)?;
    }

    let mut counts: Vec<(String, u64)> = Vec::new();
    for p in 0..3 {
        let partition = cluster.read(&handle, 0, p, p + 1)?;
        assert_keys_non_decreasing(&partition);
        counts.extend(partition);
    }

    let mut expected: HashMap<String, u64> = HashMap::new();
    for (w, _) in &words {
        *expected.entry(w.clone()).or_insert(0) += 1;
    }
    let expected: Vec<(String, u64)> = expected.into_iter().collect();
    assert_same_multiset(&counts, &expected);
    assert!(counts.contains(&("the".to_string(), 4)));
    Ok(())
}

#[test]
fn key_ordering_without_aggregation_spans_all_blocks() -> Result<()> {
    let cluster = common::cluster(3, ShuffleConf::default())?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(4, Arc::new(HashPartitioner::new(2)))
        .with_key_ordering(natural_order());
    let handle = cluster.register_shuffle(dep, 6);

    let input = keyed_records(3_000, 500);
    for (map, records) in split_round_robin(&input, 6).into_iter().enumerate() {
        cluster.run_map(&handle, map % 3, map, records)?;
    }

    let mut all = Vec::new();
    for p in 0..2 {
        let partition = cluster.read(&handle, 0, p, p + 1)?;
        assert_keys_non_decreasing(&partition);
        all.extend(partition);
    }
    assert_same_multiset(&all, &input);
    Ok(())
}

#[test]
fn descending_order_is_honoured() -> Result<()> {
    let cluster = common::cluster(1, ShuffleConf::default())?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(5, Arc::new(HashPartitioner::new(1)))
        .with_key_ordering(Arc::new(|a: &u32, b: &u32| b.cmp(a)));
    let handle = cluster.register_shuffle(dep, 1);
    cluster.run_map(&handle, 0, 0, keyed_records(200, 50))?;

    let keys: Vec<u32> = cluster.read(&handle, 0, 0, 1)?.into_iter().map(|(k, _)| k).collect();
    assert!(keys.windows(2).all(|w| w[0] >= w[1]));
    Ok(())
}

#[test]
fn collect_list_groups_every_value() -> Result<()> {
    let cluster = common::cluster(2, ShuffleConf::default())?;
    let dep = ShuffleDependency::<u32, u64, Vec<u64>>::with_aggregator(
        6,
        Arc::new(HashPartitioner::new(4)),
        Arc::new(CollectList::<u64>::new()),
        true,
    );
    let handle = cluster.register_shuffle(dep, 2);

    let input = keyed_records(600, 12);
    for (map, records) in split_round_robin(&input, 2).into_iter().enumerate() {
        cluster.run_map(&handle, map, map, records)?;
    }

    let grouped = read_sorted_by_key(&cluster, &handle, 0)?;
    assert_eq!(grouped.len(), 12);
    for (key, mut values) in grouped {
        values.sort_unstable();
        let mut expected: Vec<u64> = input.iter().filter(|(k, _)| *k == key).map(|(_, v)| *v).collect();
        expected.sort_unstable();
        assert_eq!(values, expected, "key {key}");
    }
    Ok(())
}

#[test]
fn four_maps_three_partitions_bypass() -> Result<()> {
    let cluster = common::cluster(2, ShuffleConf::default())?;
    let partitioner = Arc::new(FnPartitioner::new(3, |k: &u32| (*k % 3) as usize));
    let handle = cluster.register_shuffle(ShuffleDependency::<u32, u64, u64>::new(7, partitioner), 4);
    assert_eq!(handle.strategy, WriteStrategy::Bypass);

    let input: Vec<(u32, u64)> = (0..1_200).map(|i| (i, u64::from(i))).collect();
    for (map, records) in split_round_robin(&input, 4).into_iter().enumerate() {
        cluster.run_map(&handle, map % 2, map, records)?;
    }

    let partition = cluster.read(&handle, 1, 1, 2)?;
    let expected: Vec<(u32, u64)> = input.iter().filter(|(k, _)| k % 3 == 1).copied().collect();
    assert_eq!(partition.len(), 400);
    assert_same_multiset(&partition, &expected);
    Ok(())
}
