/// [`Rollback`] undoes a partially applied operation unless it is committed.
pub(crate) struct Rollback<F: FnOnce()> {
    undo: Option<F>,
}

impl<F: FnOnce()> Rollback<F> {
    /// Arms a new [`Rollback`].
    #[inline]
    pub(crate) fn new(undo: F) -> Self {
        Self { undo: Some(undo) }
    }

    /// Commits the operation; the undo closure is dropped without being called.
    #[inline]
    pub(crate) fn commit(mut self) {
        self.undo.take();
    }
}

impl<F: FnOnce()> Drop for Rollback<F> {
    #[inline]
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            undo();
        }
    }
}
