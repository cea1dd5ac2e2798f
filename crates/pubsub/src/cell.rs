use std::future::Future;

use tokio::sync::OnceCell;

use crate::JetStreamManager;
use crate::broker::Broker;

/// Holds a manager that is built at most once, by whichever caller gets there first.
///
/// Concurrent first callers wait for the single running initialization. A failed
/// initialization leaves the cell empty so a later caller can try again.
#[derive(Debug)]
pub struct ManagerCell<B>
where
    B: Broker,
{
    cell: OnceCell<JetStreamManager<B>>,
}

impl<B> Default for ManagerCell<B>
where
    B: Broker,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<B> ManagerCell<B>
where
    B: Broker,
{
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Returns the manager, building it with `init` if nobody has yet.
    ///
    /// # Errors
    ///
    /// Returns the error of `init` when this call ran the initialization and it failed.
    pub async fn get_or_try_init<F, Fut, E>(&self, init: F) -> Result<&JetStreamManager<B>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JetStreamManager<B>, E>>,
    {
        self.cell.get_or_try_init(init).await
    }

    /// Returns the manager if it has been built.
    pub fn get(&self) -> Option<&JetStreamManager<B>> {
        self.cell.get()
    }
}
