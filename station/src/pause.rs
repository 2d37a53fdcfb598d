//! Keypress signal
//!
//! A side thread flips one flag on the operator's first input event; the
//! control loop polls the flag between ticks. The thread is one-shot, so a
//! signal is good for a single pause or a single "stop live reading".

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Clone)]
pub struct KeypressSignal {
    flag: Arc<AtomicBool>,
}

impl KeypressSignal {
    /// A signal that never fires; non-interactive runs and tests use this.
    pub fn disarmed() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Arms the signal on the next line of stdin.
    pub fn watch_stdin() -> Self {
        let signal = Self::disarmed();
        let flag = signal.flag.clone();
        thread::Builder::new()
            .name("keypress".into())
            .spawn(move || {
                let mut line = String::new();
                let _ = std::io::stdin().lock().read_line(&mut line);
                flag.store(true, Ordering::SeqCst);
            })
            .expect("spawning the keypress thread cannot fail");
        signal
    }

    pub fn raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}
