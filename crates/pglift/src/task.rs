//! Multi-step operations with rollback.

type Undo<'a> = Box<dyn FnOnce() -> crate::error::Result<()> + 'a>;

/// Records undo actions for completed steps. Unless [`commit`] is called,
/// dropping the transaction runs them in reverse order.
///
/// [`commit`]: Transaction::commit
pub struct Transaction<'a> {
    name: String,
    undo: Vec<(String, Undo<'a>)>,
    committed: bool,
}

impl<'a> Transaction<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            undo: Vec::new(),
            committed: false,
        }
    }

    /// Registers how to revert a step that just succeeded.
    pub fn on_rollback(
        &mut self,
        step: impl Into<String>,
        undo: impl FnOnce() -> crate::error::Result<()> + 'a,
    ) {
        self.undo.push((step.into(), Box::new(undo)));
    }

    pub fn commit(mut self) {
        self.committed = true;
        self.undo.clear();
    }

    fn revert(&mut self) {
        while let Some((step, undo)) = self.undo.pop() {
            log::info!("reverting: {}", step);
            if let Err(e) = undo() {
                log::error!("failed to revert '{}' of {}: {}", step, self.name, e);
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.undo.is_empty() {
            log::warn!("{} failed, rolling back", self.name);
            self.revert();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::RefCell;

    #[test]
    fn test_rollback_in_reverse_order() {
        let log = RefCell::new(Vec::new());
        {
            let mut tx = Transaction::new("test");
            tx.on_rollback("one", || {
                log.borrow_mut().push(1);
                Ok(())
            });
            tx.on_rollback("two", || {
                log.borrow_mut().push(2);
                Err(Error::Validation("ignored".into()))
            });
            tx.on_rollback("three", || {
                log.borrow_mut().push(3);
                Ok(())
            });
        }
        assert_eq!(*log.borrow(), vec![3, 2, 1]);
    }

    #[test]
    fn test_commit_discards_undo() {
        let log = RefCell::new(Vec::new());
        let mut tx = Transaction::new("test");
        tx.on_rollback("one", || {
            log.borrow_mut().push(1);
            Ok(())
        });
        tx.commit();
        assert!(log.borrow().is_empty());
    }
}
