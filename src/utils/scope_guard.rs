/// Runs a closure when dropped, whichever way the owning scope is left.
///
/// Client tasks hold one to detach from their hub even when they bail out
/// early or get aborted.
pub struct ScopeGuard<F: FnOnce()> {
    on_drop: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn new(on_drop: F) -> Self {
        Self { on_drop: Some(on_drop) }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn runs_once_on_early_return() {
        let calls = Cell::new(0);
        let run = |bail: bool| {
            let _guard = ScopeGuard::new(|| calls.set(calls.get() + 1));
            if bail {
                return;
            }
            calls.set(calls.get() + 10);
        };
        run(true);
        assert_eq!(calls.get(), 1);
        run(false);
        assert_eq!(calls.get(), 12);
    }
}
