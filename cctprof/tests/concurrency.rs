// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use cctprof::{
    Cct, CctNode, Frame, FrameKey, MetricKind, MetricRegistry, MetricValue, ModuleId, NormalizedIp,
    SampleOutcome,
};
use cctprof_alloc::SharedArena;
use common::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn threads_sharing_a_tree_share_nodes() {
    const SAMPLES: u64 = 2_000;
    let sampler = sampler(&[]);
    let samples = sampler.register_metric("samples", MetricKind::Count).unwrap();
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let ctx = sampler.on_replay_start().unwrap();
                let (stack, context) = main_foo_bar();
                barrier.wait();
                for _ in 0..SAMPLES {
                    assert!(sampler.on_sample_with(&ctx, &stack, context, samples, 1u64).is_inserted());
                }
                sampler.on_thread_stop(ctx);
            });
        }
    });

    let trees = sampler.trees();
    assert_eq!(1, trees.len());
    let tree = &trees[0];
    assert_eq!(3, tree.node_count());
    let expected = frames(&sampler, &[at(BAR, 0x10), at(FOO, 0x20), at(MAIN, 0x30)]);
    let leaf = tree.find_path(tree.root(), &expected).unwrap();
    assert_eq!(MetricValue::Count(2 * SAMPLES), leaf.metric(samples));
    assert_eq!(2 * SAMPLES, sampler.counters().inserted());
}

fn assert_unique_children(tree: &Cct) {
    tree.walk(|node: &CctNode| {
        let mut seen = HashSet::new();
        for child in node.children() {
            assert!(seen.insert(child.key()), "duplicate child {:?}", child.key());
        }
    });
}

#[test]
fn concurrent_inserts_never_duplicate_siblings() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 500;
    let registry = Arc::new(MetricRegistry::new());
    let samples = registry.register("samples", MetricKind::Count).unwrap();
    let tree = Cct::new(SharedArena::with_capacity(16 << 20).unwrap(), registry).unwrap();
    let barrier = Barrier::new(THREADS);

    // A small alphabet so that threads keep racing for the same children.
    let frame = |n: usize| Frame::physical(NormalizedIp::new(ModuleId(1), n % 4));
    thread::scope(|s| {
        for t in 0..THREADS {
            let tree = &tree;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                let mut seed = t as u64 + 1;
                for _ in 0..ROUNDS {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    let depth = 1 + (seed % 5) as usize;
                    let path: Vec<Frame> = (0..depth).map(|d| frame((seed >> (d * 2)) as usize)).collect();
                    tree.record(&path, samples, 1u64).unwrap();
                }
            });
        }
    });

    assert_unique_children(&tree);
    assert_eq!((THREADS * ROUNDS) as u64, tree.snapshot().total(samples));
    // 4 + 16 + 64 + 256 + 1024 possible nodes at most.
    assert!(tree.node_count() <= 1364);
    let mut counted = 0;
    tree.walk(|_| counted += 1);
    assert_eq!(tree.node_count() + 1, counted);
}

#[test]
fn racing_threads_agree_on_the_node() {
    const THREADS: usize = 16;
    let registry = Arc::new(MetricRegistry::new());
    let samples = registry.register("samples", MetricKind::Count).unwrap();
    let tree = Cct::new(SharedArena::with_capacity(1 << 20).unwrap(), registry).unwrap();
    let path = [Frame::physical(NormalizedIp::new(ModuleId(1), 0x10))];
    let barrier = Barrier::new(THREADS);

    let leaves: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let leaf = tree.record(&path, samples, 1u64).unwrap();
                    leaf as *const CctNode as usize
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(leaves.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(1, tree.node_count());
    let key: FrameKey = path[0].key();
    assert_eq!(
        MetricValue::Count(THREADS as u64),
        tree.root().child(&key).unwrap().metric(samples)
    );
}

#[test]
fn rebuilding_recipes_while_sampling() {
    let sampler = sampler(&[]);
    let samples = sampler.register_metric("samples", MetricKind::Count).unwrap();
    let database = sampler.database().clone();
    let generation = database.generation();
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            loop {
                database.rebuild(vec![module(&[])]).unwrap();
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
        });
        let samplers: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    let ctx = sampler.on_replay_start().unwrap();
                    let (stack, context) = main_foo_bar();
                    for _ in 0..1_000 {
                        let outcome = sampler.on_sample_with(&ctx, &stack, context, samples, 1u64);
                        assert!(
                            matches!(outcome, SampleOutcome::Inserted { depth: 3, .. }),
                            "{outcome:?}"
                        );
                    }
                })
            })
            .collect();
        let results: Vec<_> = samplers.into_iter().map(|h| h.join()).collect();
        stop.store(true, Ordering::Relaxed);
        for result in results {
            result.unwrap();
        }
    });

    assert!(database.generation() > generation);
    let tree = &sampler.trees()[0];
    assert_eq!(2_000, tree.snapshot().total(samples));
    assert_unique_children(tree);
}
