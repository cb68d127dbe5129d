use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

/// Resolves on the next backpressure transition. Every clone observes the
/// same resolution.
pub(crate) type BackpressureChange = Shared<oneshot::Receiver<()>>;

/// Backpressure flag paired with the future that wakes code blocked on it.
///
/// The pairing makes "flag set, no change future" unrepresentable.
pub(crate) struct Backpressure {
    applied: bool,
    resolve: Option<oneshot::Sender<()>>,
    change: BackpressureChange,
}

impl Backpressure {
    pub(crate) fn new(applied: bool) -> Self {
        let (resolve, change) = oneshot::channel();
        Self {
            applied,
            resolve: Some(resolve),
            change: change.shared(),
        }
    }

    pub(crate) fn applied(&self) -> bool {
        self.applied
    }

    pub(crate) fn change(&self) -> BackpressureChange {
        self.change.clone()
    }

    /// Resolves the outstanding change future, installs a fresh one and
    /// then stores the new value.
    ///
    /// # Panics
    ///
    /// Panics if `applied` equals the current value.
    pub(crate) fn set(&mut self, applied: bool) {
        assert_ne!(
            self.applied, applied,
            "backpressure must not be set to its current value"
        );

        if let Some(resolve) = self.resolve.take() {
            let _ = resolve.send(());
        }

        let (resolve, change) = oneshot::channel();
        self.resolve = Some(resolve);
        self.change = change.shared();
        self.applied = applied;
    }
}
