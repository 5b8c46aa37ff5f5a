// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};

/// Marks a thread as being inside a sample. Taking it is a single CAS, so a
/// signal arriving while the previous one is still being handled sees the
/// flag set and backs off instead of reentering the unwinder.
#[derive(Debug)]
pub struct SampleGuard<'a> {
    flag: &'a AtomicBool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("reentrancy guard error: already in use")]
pub struct Reentered;

impl<'a> SampleGuard<'a> {
    pub fn new(flag: &'a AtomicBool) -> Result<Self, Reentered> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| SampleGuard { flag })
            .map_err(|_| Reentered)
    }
}

impl Drop for SampleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_is_refused() {
        let flag = AtomicBool::new(false);
        let guard = SampleGuard::new(&flag).unwrap();
        assert_eq!(Reentered, SampleGuard::new(&flag).unwrap_err());
        drop(guard);
        assert!(SampleGuard::new(&flag).is_ok());
        assert!(!flag.load(Ordering::SeqCst));
    }
}
