use std::net::SocketAddr;

use proxyx_command_lib::logging::setup_default_logging;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Success,
    Fail,
    Undecided,
}

/// Run `test` up to `nb_tries` times, stop at the first failure.
/// Undecided if no attempt succeeded.
pub fn repeat_until_error_or<F>(nb_tries: usize, description: &str, test: F) -> State
where
    F: Fn() -> State + Sync,
{
    println!("{description}");
    let mut last = State::Undecided;
    for i in 0..nb_tries {
        let state = test();
        match state {
            State::Fail => {
                println!("------------------------------------------------------------");
                println!("Test not successful, attempt {}/{nb_tries}", i + 1);
                println!("------------------------------------------------------------");
                return State::Fail;
            }
            State::Success => last = State::Success,
            State::Undecided => println!("attempt {}/{nb_tries} undecided", i + 1),
        }
    }
    println!("--------------------------------------------------------------------");
    println!("Test {last:?} in all {nb_tries} tries");
    println!("--------------------------------------------------------------------");
    last
}

pub fn setup_test_logging(tag: &str) {
    if let Err(e) = setup_default_logging("debug", tag) {
        println!("could not setup default logging: {e}");
    }
}

pub fn local_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}
