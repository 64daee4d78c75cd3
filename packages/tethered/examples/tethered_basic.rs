//! Submits work to the event loop from ordinary threads and waits for the results.

use std::convert::Infallible;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tethered::{Error, EventLoop, Failure};

fn main() {
    let event_loop = EventLoop::new();
    event_loop.start().expect("event loop was started in passive mode");

    let sum = event_loop
        .wait_for(|| Ok::<_, Infallible>(2 + 3), Duration::from_secs(5))
        .expect("the loop is running");
    println!("2 + 3 = {sum}");

    // Work that takes a while can be waited on with a short timeout and checked again later.
    let slow = event_loop
        .run_async(async || {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, Failure>("slow work done")
        })
        .expect("the loop is running");

    match slow.wait(Duration::from_millis(10)) {
        Err(Error::TimedOut) => println!("not done yet, checking again later"),
        other => println!("unexpectedly early: {other:?}"),
    }

    // Handles can travel to other threads as plain integers.
    let handle = slow.stash().expect("the event loop owns the store");
    let store = Arc::clone(event_loop.result_store());

    let collector = thread::spawn(move || {
        let result = store
            .retrieve::<&str>(handle)
            .expect("handle was stashed just now");
        result.wait(Duration::from_secs(5))
    });

    match collector.join().expect("collector thread panicked") {
        Ok(message) => println!("{message}"),
        Err(error) => println!("slow work failed: {error}"),
    }

    event_loop.shutdown();
}
