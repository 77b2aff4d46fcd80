//! Cooperative SIGINT handling.
//!
//! The first interrupt flips a process-wide flag that long-running
//! loops poll at safe checkpoints (after a file commits, between graph
//! visits). The second interrupt exits immediately with the
//! conventional 128+SIGINT status.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

static SIGINT_COUNT: AtomicUsize = AtomicUsize::new(0);
static INSTALL: Once = Once::new();

/// Install the handler. Safe to call more than once.
pub fn install() {
    INSTALL.call_once(|| {
        let result = ctrlc::set_handler(|| {
            let previous = SIGINT_COUNT.fetch_add(1, Ordering::SeqCst);
            if previous == 0 {
                eprintln!("Interrupted, press C-c again to exit");
            } else {
                std::process::exit(130);
            }
        });

        if let Err(err) = result {
            log::warn!("could not install SIGINT handler: {err}");
        }
    });
}

/// True once SIGINT has been received.
pub fn interrupted() -> bool {
    SIGINT_COUNT.load(Ordering::SeqCst) > 0
}

/// Forget a previously received interrupt, so a new operation can run
/// to completion.
pub fn reset() {
    SIGINT_COUNT.store(0, Ordering::SeqCst);
}
