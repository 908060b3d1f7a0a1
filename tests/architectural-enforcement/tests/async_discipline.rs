//! Integration Test: Async Discipline
//!
//! **Policy**: Production code in the conductor core and daemon MUST NOT
//! sleep, and MUST NOT use the blocking HTTP client. This includes unit test
//! modules inside `src/`: tests that need time to pass use a paused clock.

use architectural_enforcement::{calls_sleep, scan_production, uses_blocking_client};

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan_production(calls_sleep);

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nAcceptable alternatives:");
        eprintln!("  - Wait on a channel, Notify, watch or CancellationToken");
        eprintln!("  - Periodic work with tokio::time::interval()");
        eprintln!("  - Bounded waits with tokio::time::timeout()");
        eprintln!("  - Tests: #[tokio::test(start_paused = true)] with time::advance()");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_no_blocking_http_client() {
    let violations = scan_production(uses_blocking_client);

    if !violations.is_empty() {
        for violation in &violations {
            eprintln!("  {violation}");
        }
        panic!(
            "\nFound {} use(s) of reqwest::blocking in production code.",
            violations.len()
        );
    }
}
