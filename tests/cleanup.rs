mod common;

use anyhow::{Result, anyhow};
use ironshuffle::io::compression::{CompressionCodec, FinishWrite, register_codec};
use ironshuffle::testing::*;
use ironshuffle::*;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fetch workers may still be finishing a request after the reader is gone;
/// give them a moment to drop what they hold.
fn wait_for_no_temp_files(cluster: &LocalCluster) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let left = cluster.temp_files()?;
        if left.is_empty() {
            return Ok(());
        }
        if Instant::now() > deadline {
            panic!("temp files left behind: {left:?}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn count_files(dir: &Path) -> Result<usize> {
    let mut n = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            n += count_files(&entry.path())?;
        } else {
            n += 1;
        }
    }
    Ok(n)
}

fn failing_input(good: u64) -> impl Iterator<Item = Result<(u32, u64)>> {
    keyed_records(good, 50)
        .into_iter()
        .map(Ok)
        .chain(std::iter::once(Err(anyhow!("upstream failed"))))
}

#[test]
fn failed_map_task_leaves_no_files() -> Result<()> {
    let conf = ShuffleConf { num_elements_force_spill_threshold: 100, ..ShuffleConf::default() };
    let cluster = common::cluster(1, conf)?;
    let deps = [
        ShuffleDependency::<u32, u64, u64>::new(0, Arc::new(HashPartitioner::new(5))),
        ShuffleDependency::<u32, u64, u64>::new(1, Arc::new(HashPartitioner::new(300))),
        ShuffleDependency::<u32, u64, u64>::new(2, Arc::new(HashPartitioner::new(300)))
            .with_serializer(RecordSerializer::Json),
    ];
    let strategies = [WriteStrategy::Bypass, WriteStrategy::SerializedSort, WriteStrategy::DeserializedSort];

    for (dep, strategy) in deps.into_iter().zip(strategies) {
        let handle = cluster.register_shuffle(dep, 1);
        assert_eq!(handle.strategy, strategy);
        let err = cluster
            .run_map_with(&handle, 0, 0, failing_input(1_000))
            .err()
            .ok_or_else(|| anyhow!("map task succeeded"))?;
        assert!(format!("{err:#}").contains("upstream failed"), "{err:#}");
        assert_eq!(cluster.tracker().num_available_outputs(handle.shuffle_id), 0);
        assert!(cluster.temp_files()?.is_empty(), "{strategy:?}");
    }
    assert_eq!(count_files(&cluster.root_dir())?, 0);
    Ok(())
}

#[test]
fn stopping_as_successful_without_writing_is_an_error() -> Result<()> {
    let cluster = common::cluster(1, ShuffleConf::default())?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(3, Arc::new(HashPartitioner::new(4)));
    let handle = cluster.register_shuffle(dep, 1);

    let ctx = cluster.task_context(0);
    let mut writer = cluster.manager(0)?.get_writer(&handle, ctx.task_attempt_id(), Arc::clone(&ctx))?;
    assert!(writer.stop(true).is_err());
    Ok(())
}

#[test]
fn cancelled_read_reports_once_and_cleans_up() -> Result<()> {
    let conf = ShuffleConf {
        max_remote_block_size_fetch_to_mem: 0,
        max_bytes_in_flight: 1,
        ..ShuffleConf::default()
    };
    let cluster = common::cluster(2, conf)?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(4, Arc::new(HashPartitioner::new(1)));
    let handle = cluster.register_shuffle(dep, 8);
    for map in 0..8 {
        cluster.run_map(&handle, 0, map, keyed_records(500, 100))?;
    }

    let ctx = cluster.task_context(0);
    let reader = cluster.manager(1)?.get_reader(&handle, 0, 1, Arc::clone(&ctx))?;
    let mut records = reader.read()?;
    for _ in 0..10 {
        records.next().ok_or_else(|| anyhow!("stream ended early"))??;
    }
    ctx.kill("stage cancelled");

    let err = records
        .next()
        .ok_or_else(|| anyhow!("no error after kill"))?
        .err()
        .ok_or_else(|| anyhow!("record after kill"))?;
    assert!(is_task_killed(&err));
    assert!(format!("{err}").contains("stage cancelled"));
    assert!(records.next().is_none());

    drop(records);
    wait_for_no_temp_files(&cluster)
}

#[test]
fn killed_before_aggregation_fails_read_without_leaks() -> Result<()> {
    let conf = ShuffleConf { num_elements_force_spill_threshold: 50, ..ShuffleConf::default() };
    let cluster = common::cluster(2, conf)?;
    let dep = ShuffleDependency::<u32, u64, u64>::with_aggregator(
        5,
        Arc::new(HashPartitioner::new(2)),
        Arc::new(Sum::<u64>::new()),
        false,
    );
    let handle = cluster.register_shuffle(dep, 2);
    for map in 0..2 {
        cluster.run_map(&handle, map, map, keyed_records(1_000, 400))?;
    }

    let ctx = cluster.task_context(0);
    ctx.kill("speculative copy finished first");
    let err = cluster
        .read_with(&handle, 1, 0, 2, ctx)
        .err()
        .ok_or_else(|| anyhow!("read succeeded"))?;
    assert!(is_task_killed(&err), "{err:#}");
    wait_for_no_temp_files(&cluster)
}

#[test]
fn completed_task_stops_reading_quietly() -> Result<()> {
    let cluster = common::cluster(1, ShuffleConf::default())?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(6, Arc::new(HashPartitioner::new(1)));
    let handle = cluster.register_shuffle(dep, 1);
    cluster.run_map(&handle, 0, 0, keyed_records(100, 10))?;

    let ctx = cluster.task_context(0);
    let mut records = cluster.manager(0)?.get_reader(&handle, 0, 1, Arc::clone(&ctx))?.read()?;
    assert!(records.next().is_some());
    ctx.mark_completed();
    assert!(records.next().is_none());
    Ok(())
}

#[test]
fn dropping_a_partially_read_sorted_stream_deletes_spills() -> Result<()> {
    let conf = ShuffleConf { num_elements_force_spill_threshold: 100, ..ShuffleConf::default() };
    let cluster = common::cluster(1, conf)?;
    let dep = ShuffleDependency::<u32, u64, u64>::new(7, Arc::new(HashPartitioner::new(1)))
        .with_key_ordering(natural_order());
    let handle = cluster.register_shuffle(dep, 1);
    cluster.run_map(&handle, 0, 0, keyed_records(2_000, 700))?;

    let ctx = cluster.task_context(0);
    let mut records = cluster.manager(0)?.get_reader(&handle, 0, 1, Arc::clone(&ctx))?.read()?;
    assert!(records.next().is_some());
    assert!(!cluster.temp_files()?.is_empty());
    drop(records);
    assert!(cluster.temp_files()?.is_empty());
    Ok(())
}

/// Codec whose streams cannot be completed, as when the disk fills up while
/// the trailer is written.
struct TrailerFails;

struct TrailerFailsWriter<'a>(Box<dyn Write + Send + 'a>);

impl Write for TrailerFailsWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for TrailerFailsWriter<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        Err(io::Error::other("no space left for the stream trailer"))
    }
}

impl CompressionCodec for TrailerFails {
    fn name(&self) -> &str {
        "trailer-fails"
    }

    fn compressed_output<'a>(&self, out: Box<dyn Write + Send + 'a>) -> io::Result<Box<dyn FinishWrite + 'a>> {
        Ok(Box::new(TrailerFailsWriter(out)))
    }

    fn compressed_input<'a>(&self, input: Box<dyn Read + Send + 'a>) -> io::Result<Box<dyn Read + Send + 'a>> {
        Ok(input)
    }
}

#[test]
fn unfinished_compressed_stream_fails_the_map_task() -> Result<()> {
    register_codec(Arc::new(TrailerFails));
    let conf = ShuffleConf { codec: "trailer-fails".to_string(), ..ShuffleConf::default() };
    let cluster = common::cluster(1, conf)?;
    let deps = [
        ShuffleDependency::<u32, u64, u64>::new(10, Arc::new(HashPartitioner::new(5))),
        ShuffleDependency::<u32, u64, u64>::new(11, Arc::new(HashPartitioner::new(300))),
        ShuffleDependency::<u32, u64, u64>::new(12, Arc::new(HashPartitioner::new(300)))
            .with_serializer(RecordSerializer::Json),
    ];

    for dep in deps {
        let handle = cluster.register_shuffle(dep, 1);
        let err = cluster
            .run_map(&handle, 0, 0, keyed_records(200, 20))
            .err()
            .ok_or_else(|| anyhow!("map task with {:?} succeeded", handle.strategy))?;
        assert!(format!("{err:#}").contains("no space left"), "{err:#}");
        assert_eq!(cluster.tracker().num_available_outputs(handle.shuffle_id), 0);
        assert!(cluster.temp_files()?.is_empty(), "{:?}", handle.strategy);
    }
    Ok(())
}
