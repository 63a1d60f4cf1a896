//! Progress reporting for long tracking runs.

/// Receives coarse progress events once per frame or iteration.
pub trait ProgressObserver {
    /// Percent complete (0-100) and a status line.
    fn on_progress(&mut self, percent: u32, status: &str);

    /// Free-text log line.
    fn on_info(&mut self, _text: &str) {}
}

/// Observer that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressObserver for NullProgress {
    fn on_progress(&mut self, _percent: u32, _status: &str) {}
}

impl<F> ProgressObserver for F
where
    F: FnMut(u32, &str),
{
    fn on_progress(&mut self, percent: u32, status: &str) {
        self(percent, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_observer() {
        let mut seen = Vec::new();
        {
            let mut obs = |p: u32, s: &str| seen.push((p, s.to_string()));
            obs.on_progress(50, "half");
            obs.on_info("ignored");
        }
        assert_eq!(seen, vec![(50, "half".to_string())]);
    }
}
