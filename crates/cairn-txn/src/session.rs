//! A unit of work that opens its transaction on demand.

use std::sync::Arc;

use cairn_common::prelude::*;
use cairn_storage::{Chunk, Table, WriteTracker};

use crate::manager::TransactionManager;
use crate::transaction::Transaction;

/// Routes row operations through a lazily created transaction.
///
/// The transaction starts with the first write to a transactional table;
/// system and non-transactional tables are written directly. Snapshot kinds
/// also start it on the first read so their versions stay pinned. Dropping
/// a session with an open transaction rolls it back.
pub struct Session {
    manager: Arc<TransactionManager>,
    kind: TransactionType,
    txn: Option<Arc<Transaction>>,
}

impl Session {
    pub fn new(manager: Arc<TransactionManager>, kind: TransactionType) -> Self {
        Self {
            manager,
            kind,
            txn: None,
        }
    }

    pub fn kind(&self) -> TransactionType {
        self.kind
    }

    /// The open transaction, if one has started
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.txn.as_ref()
    }

    fn open(&mut self) -> Result<Arc<Transaction>> {
        if let Some(txn) = &self.txn {
            return Ok(Arc::clone(txn));
        }
        let txn = self.manager.begin(self.kind)?;
        self.txn = Some(Arc::clone(&txn));
        Ok(txn)
    }

    fn writer(&mut self, table: &Table) -> Result<Option<Arc<Transaction>>> {
        if table.is_transactional() {
            self.open().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn persist(&mut self, table: &Table, payload: &[u8]) -> Result<ChunkLocator> {
        let txn = self.writer(table)?;
        let tracker = txn.as_deref().map(|t| t as &dyn WriteTracker);
        table.persist(self.manager.engine(), payload, tracker)
    }

    pub fn update(&mut self, table: &Table, locator: ChunkLocator, payload: &[u8]) -> Result<ChunkLocator> {
        let txn = self.writer(table)?;
        let tracker = txn.as_deref().map(|t| t as &dyn WriteTracker);
        table.update(self.manager.engine(), locator, payload, tracker)
    }

    pub fn delete(&mut self, table: &Table, locator: ChunkLocator) -> Result<()> {
        let txn = self.writer(table)?;
        let tracker = txn.as_deref().map(|t| t as &dyn WriteTracker);
        table.delete(self.manager.engine(), locator, tracker)
    }

    pub fn read(&mut self, table: &Table, locator: ChunkLocator) -> Result<Option<Chunk>> {
        if self.txn.is_none() && self.kind.stamps_sequence() {
            self.open()?;
        }
        match &self.txn {
            Some(txn) => self.manager.read(txn, table, locator),
            None => self.manager.read_latest(table, locator),
        }
    }

    pub fn scan(&mut self, table: &Table) -> Result<Vec<Chunk>> {
        let txn = self.open()?;
        self.manager.scan_visible(&txn, table)
    }

    /// Start the next statement of the open transaction.
    pub fn next_statement(&self) -> Option<u32> {
        self.txn.as_ref().map(|t| t.next_statement())
    }

    pub fn commit(&mut self) -> Result<()> {
        match self.txn.take() {
            Some(txn) => self.manager.commit(&txn),
            None => Ok(()),
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        match self.txn.take() {
            Some(txn) => self.manager.rollback(&txn),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            if txn.is_active() {
                warn!(txn = %txn.id(), "session dropped with an open transaction; rolling back");
                if let Err(e) = self.manager.rollback(&txn) {
                    error!(txn = %txn.id(), error = %e, "rollback on drop failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::testing::{fixtures, TestContext};
    use cairn_storage::{StorageEngine, TableOptions};

    fn setup(ctx: &TestContext) -> (Arc<TransactionManager>, Arc<Table>, Arc<Table>) {
        let engine = Arc::new(StorageEngine::open(ctx.small_config()).unwrap());
        let rows = engine.create_table(TableOptions::data(ObjectId(10), "rows")).unwrap();
        let catalog = engine
            .create_table(TableOptions::system(ObjectId(2), "catalog"))
            .unwrap();
        (Arc::new(TransactionManager::new(engine)), rows, catalog)
    }

    #[test]
    fn test_transaction_starts_on_first_write() {
        let ctx = TestContext::new();
        let (mgr, rows, catalog) = setup(&ctx);
        let mut session = Session::new(Arc::clone(&mgr), TransactionType::ReadCommitted);

        session.persist(&catalog, &fixtures::row(1, 8)).unwrap();
        assert!(session.transaction().is_none());
        assert!(session.read(&catalog, catalog.scan(mgr.engine()).unwrap()[0].locator).unwrap().is_some());
        assert!(session.transaction().is_none());

        let locator = session.persist(&rows, &fixtures::row(2, 8)).unwrap();
        assert!(session.transaction().is_some());
        assert_eq!(session.next_statement(), Some(1));
        assert!(session.read(&rows, locator).unwrap().is_some());
        assert_eq!(mgr.active_count(), 1);

        session.commit().unwrap();
        assert!(session.transaction().is_none());
        assert_eq!(mgr.active_count(), 0);
        assert!(mgr.read_latest(&rows, locator).unwrap().is_some());
    }

    #[test]
    fn test_drop_rolls_back() {
        let ctx = TestContext::new();
        let (mgr, rows, _) = setup(&ctx);
        let locator = {
            let mut session = Session::new(Arc::clone(&mgr), TransactionType::ReadCommitted);
            session.persist(&rows, &fixtures::row(1, 8)).unwrap()
        };
        assert_eq!(mgr.active_count(), 0);
        assert_eq!(mgr.stats().txns_rolled_back, 1);
        assert!(mgr.read_latest(&rows, locator).unwrap().is_none());
    }

    #[test]
    fn test_fixed_session_reads_only() {
        let ctx = TestContext::new();
        let (mgr, rows, catalog) = setup(&ctx);
        let locator = rows.persist(mgr.engine(), &fixtures::row(1, 8), None).unwrap();

        let mut session = Session::new(Arc::clone(&mgr), TransactionType::Fixed);
        assert!(session.read(&rows, locator).unwrap().is_some());
        assert!(session.transaction().is_some());

        let err = session.update(&rows, locator, &fixtures::row(2, 8)).unwrap_err();
        assert!(matches!(err, Error::Transaction(TransactionError::ReadOnly(_))));
        // System tables bypass the transaction
        session.persist(&catalog, &fixtures::row(3, 8)).unwrap();
        assert_eq!(session.scan(&rows).unwrap().len(), 1);
        session.commit().unwrap();
    }
}
