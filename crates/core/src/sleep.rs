use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Sleep for `total`, polling `stop` between increments of at most `step`.
/// Returns `false` if the sleep was cut short by a stop request.
pub fn sleep_interruptible(total: Duration, step: Duration, stop: &AtomicBool) -> bool {
    let step = step.max(Duration::from_millis(1));
    let mut left = total;
    while !left.is_zero() {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let chunk = left.min(step);
        thread::sleep(chunk);
        left -= chunk;
    }
    !stop.load(Ordering::Acquire)
}

/// Sleep for exact milliseconds.
pub fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}
