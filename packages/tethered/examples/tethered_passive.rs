//! Drives the reactor from a thread the host owns, using passive mode.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tethered::{Error, EventLoop, Reactor, TokioReactor};

fn main() {
    let reactor = Arc::new(TokioReactor::new());

    let shared_reactor: Arc<dyn Reactor> = Arc::<TokioReactor>::clone(&reactor);
    let event_loop = EventLoop::builder().reactor(shared_reactor).build();
    event_loop
        .start_passive()
        .expect("event loop was already started in running mode");

    // The host decides where the loop runs.
    let loop_reactor = Arc::clone(&reactor);
    let loop_thread = thread::spawn(move || loop_reactor.run());

    let (result, resolver) = event_loop
        .pending::<String>()
        .expect("the loop is running");

    // Some host callback on the loop thread eventually produces the value.
    reactor.call_from_thread(Box::new(move || {
        resolver.succeed("produced by a loop callback".to_string());
    }));

    println!("{}", result.wait(Duration::from_secs(5)).expect("resolved"));

    // When the host stops its loop, pending results are released.
    let (abandoned, _resolver) = event_loop.pending::<u32>().expect("the loop is running");
    let stopping = Arc::clone(&reactor);
    reactor.call_from_thread(Box::new(move || stopping.stop()));
    loop_thread.join().expect("loop thread panicked");

    assert!(matches!(
        abandoned.wait(Duration::from_secs(5)),
        Err(Error::LoopStopped)
    ));
    println!("pending result released when the loop stopped");
}
