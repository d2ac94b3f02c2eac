//! Mixed-workload driver: runs a configurable read/insert/erase/update/upsert mix
//! against one shared table from many threads and reports throughput.
//!
//! Each thread owns a disjoint, shuffled key range, so the per-thread sequence
//! assertions (reads hit exactly the keys that thread has inserted and not yet erased)
//! stay valid under full concurrency.

use std::thread;
use std::time::Instant;

use clap::Parser;
use rand::prelude::*;
use stripemap_rs::StripeMap;

#[derive(Copy, Clone)]
enum OpKind {
    Read,
    Insert,
    Erase,
    Update,
    Upsert,
}

#[derive(Parser, Debug)]
#[command(about = "Drive a mixed workload against StripeMap")]
struct Args {
    /// Initial hashpower; the table starts with 2^init_size buckets
    #[clap(long, default_value_t = 25)]
    init_size: usize,

    /// Percentage of read operations
    #[clap(long, default_value_t = 100)]
    reads: usize,

    /// Percentage of insert operations
    #[clap(long, default_value_t = 0)]
    inserts: usize,

    /// Percentage of erase operations
    #[clap(long, default_value_t = 0)]
    erases: usize,

    /// Percentage of update operations
    #[clap(long, default_value_t = 0)]
    updates: usize,

    /// Percentage of upsert operations
    #[clap(long, default_value_t = 0)]
    upserts: usize,

    /// Percentage of the initial capacity inserted before timing starts
    #[clap(long, default_value_t = 0)]
    prefill: usize,

    /// Total operations as a percentage of the initial capacity
    #[clap(long, default_value_t = 70)]
    total_ops: usize,

    /// Worker thread count; defaults to the CPU count
    #[clap(long)]
    num_threads: Option<usize>,

    /// RNG seed; random when omitted
    #[clap(long)]
    seed: Option<u64>,
}

fn mix(
    table: &StripeMap<u64, u64>,
    num_ops: usize,
    op_mix: &[OpKind; 100],
    keys: &[u64],
    prefill: usize,
) {
    let num_keys = keys.len();
    assert!(num_keys.is_power_of_two());
    let a = num_keys / 2 + 1;
    let c = num_keys / 4 - 1;
    let mask = num_keys - 1;

    let mut find_seq = 0usize;
    let mut insert_seq = prefill;
    let mut erase_seq = 0usize;

    let mut done = 0usize;
    while done < num_ops {
        for op in op_mix.iter() {
            if done >= num_ops {
                break;
            }
            match op {
                OpKind::Read => {
                    let expected = find_seq >= erase_seq && find_seq < insert_seq;
                    let got = table.get(&keys[find_seq]).is_some();
                    assert_eq!(expected, got);
                    find_seq = (a * find_seq + c) & mask;
                }
                OpKind::Insert => {
                    table.insert(keys[insert_seq], keys[insert_seq]);
                    insert_seq += 1;
                }
                OpKind::Erase => {
                    if erase_seq == insert_seq {
                        assert!(!table.erase(&keys[find_seq]));
                        find_seq = (a * find_seq + c) & mask;
                    } else {
                        assert!(table.erase(&keys[erase_seq]));
                        erase_seq += 1;
                    }
                }
                OpKind::Update => {
                    let expected = find_seq >= erase_seq && find_seq < insert_seq;
                    let got = table.update(&keys[find_seq], keys[find_seq]);
                    assert_eq!(expected, got);
                    find_seq = (a * find_seq + c) & mask;
                }
                OpKind::Upsert => {
                    let n = find_seq.min(insert_seq);
                    table.upsert(keys[n], |_| {}, keys[n]);
                    if n == insert_seq {
                        insert_seq += 1;
                    } else {
                        find_seq = (a * find_seq + c) & mask;
                    }
                }
            }
            done += 1;
        }
    }
}

fn main() {
    let args = Args::parse();

    if args.reads + args.inserts + args.erases + args.updates + args.upserts != 100 {
        eprintln!("The sum of read, insert, erase, update, and upsert percentages must be 100");
        std::process::exit(1);
    }

    let num_threads = args.num_threads.unwrap_or_else(num_cpus::get).max(1);
    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);

    let initial_capacity = 1usize << args.init_size;
    let total_ops = initial_capacity * args.total_ops / 100;
    let prefill_elems = initial_capacity * args.prefill / 100;

    let mut op_mix = [OpKind::Read; 100];
    let mut slot = 0;
    for (kind, share) in [
        (OpKind::Read, args.reads),
        (OpKind::Insert, args.inserts),
        (OpKind::Erase, args.erases),
        (OpKind::Update, args.updates),
        (OpKind::Upsert, args.upserts),
    ] {
        for _ in 0..share {
            op_mix[slot] = kind;
            slot += 1;
        }
    }
    op_mix.shuffle(&mut rng);

    let max_insert_ops = (total_ops + 99) / 100 * (args.inserts + args.erases);
    let insert_keys = initial_capacity.max(max_insert_ops) + prefill_elems;
    let keys_per_thread = ((insert_keys + num_threads - 1) / num_threads)
        .next_power_of_two()
        .max(4);
    let prefill_per_thread = prefill_elems / num_threads;
    assert!(keys_per_thread > prefill_per_thread);

    let mut nums: Vec<Vec<u64>> = Vec::with_capacity(num_threads);
    for t in 0..num_threads {
        let start = (t * keys_per_thread) as u64;
        let mut keys: Vec<u64> = (start + 1..=start + keys_per_thread as u64).collect();
        keys.shuffle(&mut rng);
        nums.push(keys);
    }
    println!("Generated test data");

    let table: StripeMap<u64, u64> = StripeMap::with_hashpower(args.init_size);
    thread::scope(|scope| {
        for keys in nums.iter() {
            let table = &table;
            scope.spawn(move || {
                for k in keys.iter().take(prefill_per_thread) {
                    assert!(table.insert(*k, *k));
                }
            });
        }
    });

    println!(
        "Start mixing: table size: {}, table capacity: {}",
        table.len(),
        table.capacity()
    );
    let ops_per_thread = total_ops / num_threads;
    let start_time = Instant::now();
    thread::scope(|scope| {
        for keys in nums.iter() {
            let table = &table;
            let op_mix = &op_mix;
            scope.spawn(move || mix(table, ops_per_thread, op_mix, keys, prefill_per_thread));
        }
    });
    let elapsed = start_time.elapsed().as_secs_f64();

    println!(
        "init-size: {}, prefill: {}%, total-ops: {}, read: {}%, insert: {}%, erase: {}%, update: {}%, upsert: {}%",
        args.init_size,
        args.prefill,
        total_ops,
        args.reads,
        args.inserts,
        args.erases,
        args.updates,
        args.upserts
    );
    println!(
        "End mixing: total ops: {}, seed: {}, num_threads: {}, elapse: {:.3} s, throughput: {:.0} ops/s",
        total_ops,
        seed,
        num_threads,
        elapsed,
        total_ops as f64 / elapsed
    );
    println!("{}", table.stat());
}
