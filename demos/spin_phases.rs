//! Example: Running event-loop code from synchronous tests
//!
//! This example shows how a `Spinner` waits on a deferred result, how it
//! reports what the reactor was left holding, and how `RunTest` turns a set
//! of phases into a single reported outcome.

use std::time::Duration;
use testkit_reactor::prelude::*;

fn main() {
    println!("🧰 testkit-reactor - Spinner Examples\n");

    example_wait_for_result();
    example_timeout();
    example_junk();
    example_run_test();

    println!("\n✅ All spinner examples completed!");
}

fn spinner() -> Spinner {
    Spinner::with_config(
        Reactor::new(),
        SpinnerConfig::new().with_signal_handling(false),
    )
}

/// Waiting on a result that arrives later
fn example_wait_for_result() {
    println!("📌 Example 1: Waiting for a result");

    let spinner = spinner();
    let reactor = spinner.reactor().clone();
    let result = spinner.run(Duration::from_secs(1), || {
        let sleeper = reactor.clone();
        reactor.spawn_named("answer", async move {
            sleeper.sleep(Duration::from_millis(20)).await;
            Ok("forty-two")
        })
    });
    println!("   Result after 20ms: {:?}\n", result);
}

/// A result that never arrives
fn example_timeout() {
    println!("📌 Example 2: Timeouts");

    let spinner = spinner();
    match spinner.run(Duration::from_millis(50), Deferred::<()>::new) {
        Err(e) => println!("   Timed out as expected: {}\n", e),
        Ok(()) => println!("   Unexpected result\n"),
    }
}

/// Leftover reactor state is reported and must be cleared
fn example_junk() {
    println!("📌 Example 3: Junk");

    let spinner = spinner();
    let reactor = spinner.reactor().clone();
    let _ = spinner.run(Duration::from_secs(1), || {
        reactor.call_later(Duration::from_secs(60), || {});
        Ok::<_, Failure>(())
    });
    println!("   Left behind: {}", Junk::describe_all(&spinner.get_junk()));

    if let Err(e) = spinner.run(Duration::from_secs(1), || Ok::<_, Failure>(())) {
        println!("   Next run refused: {}", e);
    }
    spinner.clear_junk();
    println!(
        "   After clearing: {:?}\n",
        spinner.run(Duration::from_secs(1), || Ok::<_, Failure>("clean"))
    );
}

/// Phases of a test reported as one outcome
fn example_run_test() {
    println!("📌 Example 4: RunTest");

    let spinner = spinner();
    let reactor = spinner.reactor().clone();
    let test = TestPhases::new("test_addition")
        .set_up(|| Ok(()))
        .body(move || {
            let check = Deferred::new();
            let fire = check.clone();
            reactor.call_later(Duration::from_millis(10), move || {
                let _ = fire.errback(Failure::assertion("2 + 2 != 5"));
            });
            check
        })
        .tear_down(|| {
            println!("   tear_down ran");
            Ok(())
        });

    let mut result = RecordingResult::new();
    match RunTest::new(spinner).run(test, &mut result) {
        Ok(outcome) => println!("   Outcome: {}", outcome),
        Err(e) => println!("   Run did not finish: {}", e),
    }
    println!("   Reported: {:?}", result.event_names());
}
