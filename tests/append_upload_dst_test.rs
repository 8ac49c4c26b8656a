//! Appendable Upload DST Tests
//!
//! Deterministic simulation tests (seed-based) for appendable uploads.
//! Each run writes random data through the append stream while the
//! simulated server drops streams (sometimes after persisting), redirects
//! and completes streams early. At the end the upload is finalized, or
//! closed and resumed through a takeover, and the object is compared byte
//! for byte and by CRC32C with what was written.

use bidi_storage::config::AppendConfig;
use bidi_storage::simulator::{
    run_append_dst_batch, summarize_batch, AppendDstConfig, AppendDstHarness,
};

// =============================================================================
// Single Seed Tests
// =============================================================================

#[test]
fn test_append_dst_single_calm() {
    let mut harness = AppendDstHarness::new(AppendDstConfig::calm(12345));

    harness.run(500);
    harness.check_invariants();

    let result = harness.result();
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Calm mode should not violate invariants: {:?}",
        result.invariant_violations
    );
    assert!(result.finalized);
    assert!(!result.exhausted);
    let meta = result.final_metadata.as_ref().expect("finalized upload has metadata");
    assert_eq!(meta.size, result.bytes_written);
}

#[test]
fn test_append_dst_calm_close_then_takeover() {
    let config = AppendDstConfig {
        finalize_probability: 0.0,
        ..AppendDstConfig::calm(777)
    };
    let mut harness = AppendDstHarness::new(config);
    harness.run(200);
    harness.check_invariants();

    let result = harness.result();
    println!("{}", result.summary());
    assert!(
        result.is_success(),
        "Takeover should not violate invariants: {:?}",
        result.invariant_violations
    );
    assert_eq!(result.takeovers, 1);
    assert!(result.finalized);
}

#[test]
fn test_append_dst_calm_unchecksummed() {
    let mut append = AppendConfig::test();
    append.chunking.checksum_enabled = false;
    let config = AppendDstConfig {
        append,
        ..AppendDstConfig::calm(4242)
    };
    let mut harness = AppendDstHarness::new(config);
    harness.run(200);
    harness.check_invariants();

    let result = harness.result();
    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert_eq!(result.final_metadata.as_ref().and_then(|m| m.crc32c), None);
}

#[test]
fn test_append_dst_single_moderate() {
    let mut harness = AppendDstHarness::new(AppendDstConfig::moderate(54321));

    harness.run(300);
    harness.check_invariants();

    let result = harness.result();
    println!("{}", result.summary());
    println!("Server stats: {:?}", result.server_stats);

    assert_eq!(result.total_operations, 300);
}

#[test]
fn test_append_dst_single_chaos() {
    let mut harness = AppendDstHarness::new(AppendDstConfig::chaos(99999));

    harness.run(200);
    harness.check_invariants();

    let result = harness.result();
    println!("{}", result.summary());
    println!("Server stats: {:?}", result.server_stats);

    assert_eq!(result.history.len(), 200);
}

// =============================================================================
// Multi-Seed Batch Tests (DST)
// =============================================================================

#[test]
fn test_append_dst_100_seeds_calm() {
    let results = run_append_dst_batch(0, 100, 200, AppendDstConfig::calm);
    let summary = summarize_batch(&results);
    println!("{}", summary);

    let failed: Vec<_> = results.iter().filter(|r| !r.is_success()).collect();
    for r in &failed {
        println!("FAILED: {}", r.summary());
        for v in &r.invariant_violations {
            println!("  - {}", v);
        }
    }
    assert!(failed.is_empty(), "{}", summary);
    assert!(results.iter().all(|r| r.finalized));
}

#[test]
fn test_append_dst_100_seeds_moderate() {
    let results = run_append_dst_batch(1000, 100, 200, AppendDstConfig::moderate);
    let summary = summarize_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert!(passed >= 80, "Expected at least 80% pass rate: {}", summary);
}

#[test]
fn test_append_dst_50_seeds_chaos() {
    let results = run_append_dst_batch(5000, 50, 150, AppendDstConfig::chaos);
    let summary = summarize_batch(&results);
    println!("{}", summary);

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    assert_eq!(total_ops, 50 * 150);
}

// =============================================================================
// Determinism
// =============================================================================

#[test]
fn test_append_dst_deterministic() {
    let run = || {
        let mut harness = AppendDstHarness::new(AppendDstConfig::chaos(31337));
        harness.run(200);
        harness.check_invariants();
        harness.into_result()
    };
    let a = run();
    let b = run();

    assert_eq!(a.bytes_written, b.bytes_written);
    assert_eq!(a.finalized, b.finalized);
    assert_eq!(a.final_metadata, b.final_metadata);
    assert_eq!(a.server_stats.events_delivered, b.server_stats.events_delivered);
    assert_eq!(a.invariant_violations, b.invariant_violations);
}
