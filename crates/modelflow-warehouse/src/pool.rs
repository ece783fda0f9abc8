//! Bounded connection pool
//!
//! A semaphore caps how many statements run against the warehouse at once.
//! A checked-out connection holds a permit that is released when the guard
//! is dropped, whichever way the holder exits.

use crate::adapter::{Warehouse, WarehouseError};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared warehouse with a fixed number of connection slots
#[derive(Clone)]
pub struct WarehousePool {
    warehouse: Arc<dyn Warehouse>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WarehousePool {
    /// Create a pool with `size` slots (at least one)
    pub fn new(warehouse: Arc<dyn Warehouse>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            warehouse,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently checked out
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Wait for a free slot
    pub async fn checkout(&self) -> Result<PooledConnection, WarehouseError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WarehouseError::PoolClosed)?;

        Ok(PooledConnection {
            warehouse: self.warehouse.clone(),
            _permit: permit,
        })
    }

    /// Refuse further checkouts; connections already out stay valid
    pub fn close(&self) {
        self.permits.close();
    }
}

impl std::fmt::Debug for WarehousePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehousePool")
            .field("warehouse", &self.warehouse.name())
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

/// A checked-out slot
pub struct PooledConnection {
    warehouse: Arc<dyn Warehouse>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn Warehouse;

    fn deref(&self) -> &Self::Target {
        &*self.warehouse
    }
}
