//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code never blocks a thread with `std::thread::sleep`.
//! Async timers (`tokio::time::sleep`, `sleep_until`) are allowed only in the
//! session actor, which owns the reconnect schedule. Everything else waits on
//! I/O or channels.

use std::path::Path;

use architectural_enforcement::scan;

fn is_session_actor(path: &Path) -> bool {
    path.ends_with("switchboard/core/src/client.rs")
}

fn report(kind: &str, violations: &[architectural_enforcement::Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ CRITICAL: {kind} found in production code!\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    eprintln!("\n✅ ACCEPTABLE:");
    eprintln!("  - Retry backoff timer in the session actor (tokio::time::sleep_until)");
    eprintln!("  - Test code (#[cfg(test)] modules and tests/)");
    eprintln!("\n❌ FORBIDDEN:");
    eprintln!("  - Sleep in polling loops");
    eprintln!("  - Sleep as poor man's synchronization");

    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

/// No thread sleeps anywhere
#[test]
fn test_no_thread_sleep_in_production_code() {
    let violations = scan(|_, code| {
        code.contains("thread::sleep(") || code.contains("std::thread::sleep")
    });
    report("Thread sleeps", &violations);
}

/// Async timers only drive reconnect backoff
#[test]
fn test_async_timers_only_in_session_actor() {
    let violations = scan(|path, code| {
        let timer = code.contains("time::sleep(")
            || code.contains("time::sleep_until(")
            || code.contains("time::interval(");
        timer && !is_session_actor(path)
    });
    report("Async timers outside the session actor", &violations);
}
