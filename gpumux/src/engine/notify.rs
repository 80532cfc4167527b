use std::sync::{Condvar, Mutex};

/// Single-slot work notification: `notify` is idempotent while a signal is
/// pending, `wait` consumes one signal and blocks when none is pending.
pub(crate) struct Notifier {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut signaled = self.signaled.lock().expect("notifier mutex poisoned");
        *signaled = true;
        self.cv.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock().expect("notifier mutex poisoned");
        while !*signaled {
            signaled = self.cv.wait(signaled).expect("notifier mutex poisoned");
        }
        *signaled = false;
    }
}
