//! Statistical properties of the hash functions and partition assignment.

use oxijoin::codec::{bucket_mix, hash32, partition_mix};
use oxijoin::{FileIoManager, HashJoin, MemorySegment};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn relative_std_dev(counts: &[u64]) -> f64 {
    let mean = counts.iter().sum::<u64>() as f64 / counts.len() as f64;
    let variance = counts
        .iter()
        .map(|&c| (c as f64 - mean) * (c as f64 - mean))
        .sum::<f64>()
        / counts.len() as f64;
    variance.sqrt() / mean
}

#[test]
fn bucket_hash_spreads_random_keys_evenly() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x0b5e55ed);
    let num_buckets = 512u32;
    let mut counts = vec![0u64; num_buckets as usize];

    for _ in 0..100_000 {
        let key: u64 = rng.gen();
        let hash = bucket_mix(hash32(&key.to_le_bytes()), 0);
        counts[(hash & (num_buckets - 1)) as usize] += 1;
    }

    let rel = relative_std_dev(&counts);
    assert!(rel < 0.1, "bucket loads too uneven: {rel}");
}

#[test]
fn bucket_and_partition_hashes_are_independent() {
    // If the two mixers were correlated, partitions would collapse onto
    // bucket stripes. Compare the joint distribution over a coarse grid
    // against the product of its marginals.
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let total = 200_000u64;
    let mut joint = [[0u64; 16]; 16];

    for _ in 0..total {
        let code: u32 = rng.gen();
        let bucket = (bucket_mix(code, 0) & 15) as usize;
        let partition = (partition_mix(code, 0) & 15) as usize;
        joint[bucket][partition] += 1;
    }

    let row: Vec<u64> = joint.iter().map(|r| r.iter().sum()).collect();
    let col: Vec<u64> = (0..16).map(|p| joint.iter().map(|r| r[p]).sum()).collect();
    for bucket in 0..16 {
        for partition in 0..16 {
            let expected = row[bucket] as f64 * col[partition] as f64 / total as f64;
            let residual = (joint[bucket][partition] as f64 - expected) / expected.sqrt();
            assert!(
                residual.abs() < 6.0,
                "cell ({bucket},{partition}) deviates from independence: {residual:.2}"
            );
        }
    }
}

#[test]
fn hashes_are_identical_across_passes() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for _ in 0..10_000 {
        let code: u32 = rng.gen();
        assert_eq!(bucket_mix(code, 0), bucket_mix(code, 0));
        assert_eq!(partition_mix(code, 3), partition_mix(code, 3));
    }
}

#[test]
fn partition_loads_stay_balanced_at_scale() {
    // 100,000 random keys through a real join. Partition assignment is
    // bucket-granular, so balance is coarser than a per-record multinomial;
    // the bound reflects that.
    let mut rng = ChaCha8Rng::seed_from_u64(0xfeed);
    let build: Vec<(u64, u64)> = (0..100_000).map(|i| (rng.gen(), i)).collect();

    let dir = tempfile::tempdir().unwrap();
    let io = FileIoManager::new(dir.path()).unwrap();
    let memory = MemorySegment::alloc_many(64, 32 * 1024).unwrap();
    let mut join = HashJoin::new(
        build.into_iter(),
        Vec::<(u64, u64)>::new().into_iter(),
        memory,
        io,
        16,
    )
    .unwrap();
    join.open().unwrap();

    let counts: Vec<u64> = (0..join.num_partitions())
        .map(|i| join.partition_record_count(i))
        .collect();
    assert_eq!(counts.iter().sum::<u64>(), 100_000);

    let mean = 100_000.0 / counts.len() as f64;
    let rel = relative_std_dev(&counts);
    assert!(rel < 0.25, "partition loads too uneven: {rel} ({counts:?})");
    for (index, &count) in counts.iter().enumerate() {
        let ratio = count as f64 / mean;
        assert!(
            (0.4..1.6).contains(&ratio),
            "partition {index} holds {count} records ({ratio:.2}x mean)"
        );
    }

    let segments = join.close().unwrap();
    assert_eq!(segments.len(), 64);
}
