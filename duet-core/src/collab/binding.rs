//! Origin-tagged bidirectional sync between the editor and the mirror.
//!
//! Local operations are written into the mirror under [`LOCAL_ORIGIN`] and
//! come back out as an encoded update for the transport. Remote updates are
//! applied under [`REMOTE_ORIGIN`] and turned into operations by diffing the
//! mirror against the local tree. Local transactions are never reconciled
//! back, which is what keeps an edit from echoing into the editor twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{DeepObservable, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::capability::OperationSink;
use crate::collab::mirror::Mirror;
use crate::collab::reconcile;
use crate::document::Document;
use crate::error::CoreError;
use crate::operation::Operation;

pub const LOCAL_ORIGIN: &str = "duet-local";
pub const REMOTE_ORIGIN: &str = "duet-remote";

pub struct Binding {
    mirror: Mirror,
    subscription: Option<Subscription>,
    remote_transactions: Arc<AtomicU64>,
}

impl Default for Binding {
    fn default() -> Self {
        Self::new()
    }
}

impl Binding {
    pub fn new() -> Self {
        let mirror = Mirror::new();
        let remote_transactions = Arc::new(AtomicU64::new(0));

        let counter = remote_transactions.clone();
        let local = yrs::Origin::from(LOCAL_ORIGIN);
        let subscription = mirror.content().observe_deep(move |txn, _events| {
            if txn.origin() != Some(&local) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        Self {
            mirror,
            subscription: Some(subscription),
            remote_transactions,
        }
    }

    fn live(&self) -> Result<&Mirror, CoreError> {
        if self.subscription.is_none() {
            return Err(CoreError::Disposed);
        }
        Ok(&self.mirror)
    }

    /// Writes `ops` into the mirror in one transaction and returns the
    /// encoded update, or `None` when there was nothing to write.
    /// `document` is the local tree after `ops`.
    pub fn apply_local(&self, ops: &[Operation], document: &Document) -> Result<Option<Vec<u8>>, CoreError> {
        let mirror = self.live()?;
        if ops.is_empty() {
            return Ok(None);
        }
        let mut before = document.clone();
        for op in ops.iter().rev() {
            before.apply(&op.inverse())?;
        }
        let mut txn = mirror.doc().transact_mut_with(LOCAL_ORIGIN);
        mirror.apply_ops(&mut txn, ops, before)?;
        let update = txn.encode_update_v1();
        debug!("local transaction: {} ops, {} bytes", ops.len(), update.len());
        Ok(Some(update))
    }

    /// Applies a remote update and returns the operations that bring `local`
    /// in line with the mirror.
    pub fn apply_remote(&self, update: &[u8], local: &Document) -> Result<Vec<Operation>, CoreError> {
        let mirror = self.live()?;
        let update = Update::decode_v1(update)?;
        {
            let mut txn = mirror.doc().transact_mut_with(REMOTE_ORIGIN);
            txn.apply_update(update).map_err(|e| CoreError::Crdt(e.to_string()))?;
        }
        self.reconcile(local)
    }

    /// Operations turning `local` into the tree the mirror currently holds.
    pub fn reconcile(&self, local: &Document) -> Result<Vec<Operation>, CoreError> {
        let remote = self.live()?.read_document();
        let ops = reconcile::diff(local, &remote);
        if !ops.is_empty() {
            debug!("reconciled {} remote ops", ops.len());
        }
        Ok(ops)
    }

    /// Loads `doc` into an empty mirror. Returns `None` when the mirror
    /// already has content.
    pub fn seed(&self, doc: &Document) -> Result<Option<Vec<u8>>, CoreError> {
        let mirror = self.live()?;
        if !mirror.is_empty() {
            warn!("refusing to seed a mirror that already has content");
            return Ok(None);
        }
        let mut txn = mirror.doc().transact_mut_with(LOCAL_ORIGIN);
        mirror.write_document(&mut txn, doc)?;
        Ok(Some(txn.encode_update_v1()))
    }

    pub fn is_empty(&self) -> Result<bool, CoreError> {
        Ok(self.live()?.is_empty())
    }

    pub fn read_document(&self) -> Result<Document, CoreError> {
        Ok(self.live()?.read_document())
    }

    pub fn encode_state_vector(&self) -> Result<Vec<u8>, CoreError> {
        let txn = self.live()?.doc().transact();
        Ok(txn.state_vector().encode_v1())
    }

    /// Everything this replica has that the peer with `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CoreError> {
        let sv = StateVector::decode_v1(state_vector)?;
        let txn = self.live()?.doc().transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    pub fn encode_state(&self) -> Result<Vec<u8>, CoreError> {
        let txn = self.live()?.doc().transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Number of non-local transactions observed on the content array.
    pub fn remote_transactions(&self) -> u64 {
        self.remote_transactions.load(Ordering::Relaxed)
    }

    /// Drops the observer. Every later call fails with [`CoreError::Disposed`].
    pub fn dispose(&mut self) {
        if self.subscription.take().is_some() {
            debug!("binding disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.subscription.is_none()
    }
}

impl OperationSink for Binding {
    type Output = Option<Vec<u8>>;

    fn apply_local(&mut self, ops: &[Operation], document: &Document) -> Result<Self::Output, CoreError> {
        Binding::apply_local(self, ops, document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{BlockKind, Node};

    fn seeded(doc: &Document) -> (Binding, Vec<u8>) {
        let binding = Binding::new();
        let update = binding.seed(doc).unwrap().unwrap();
        (binding, update)
    }

    #[test]
    fn test_local_ops_do_not_echo() {
        let mut doc = Document::initial();
        let (binding, _) = seeded(&doc);
        let op = Operation::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "Hey. ".into(),
        };
        doc.apply(&op).unwrap();

        let update = binding.apply_local(&[op], &doc).unwrap();
        assert!(update.is_some());
        assert_eq!(binding.remote_transactions(), 0);
        assert!(binding.reconcile(&doc).unwrap().is_empty());
        assert_eq!(binding.apply_local(&[], &doc).unwrap(), None);
    }

    #[test]
    fn test_remote_update_reconciles() {
        let (a, seed) = seeded(&Document::initial());
        let b = Binding::new();
        let local_b = Document::default();
        let ops = b.apply_remote(&seed, &local_b).unwrap();
        assert_eq!(b.remote_transactions(), 1);

        let mut doc_b = local_b.clone();
        for op in &ops {
            doc_b.apply(op).unwrap();
        }
        assert_eq!(doc_b, Document::initial());

        let remove = Operation::RemoveNode {
            path: vec![2],
            node: Node::element(BlockKind::BlockQuote, vec![Node::text("A wise quote.")]),
        };
        let mut doc_a = Document::initial();
        doc_a.apply(&remove).unwrap();
        let update = a.apply_local(&[remove], &doc_a).unwrap().unwrap();
        let ops = b.apply_remote(&update, &doc_b).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], Operation::RemoveNode { ref path, .. } if path == &vec![2]));
    }

    #[test]
    fn test_state_vector_diff_sync() {
        let (a, _) = seeded(&Document::initial());
        let b = Binding::new();
        let diff = a.encode_diff(&b.encode_state_vector().unwrap()).unwrap();
        b.apply_remote(&diff, &Document::default()).unwrap();
        assert_eq!(b.read_document().unwrap(), Document::initial());

        let c = Binding::new();
        c.apply_remote(&a.encode_state().unwrap(), &Document::default()).unwrap();
        assert_eq!(c.read_document().unwrap(), Document::initial());
    }

    #[test]
    fn test_seed_requires_empty_mirror() {
        let (binding, _) = seeded(&Document::initial());
        assert_eq!(binding.seed(&Document::initial()).unwrap(), None);
        assert!(!binding.is_empty().unwrap());
    }

    #[test]
    fn test_malformed_update() {
        let binding = Binding::new();
        let err = binding.apply_remote(&[0xff, 0xff, 0xff], &Document::default());
        assert!(matches!(err, Err(CoreError::Crdt(_))));
    }

    #[test]
    fn test_dispose() {
        let mut binding = Binding::new();
        binding.dispose();
        assert!(binding.is_disposed());
        assert_eq!(binding.apply_local(&[], &Document::default()), Err(CoreError::Disposed));
        assert_eq!(binding.encode_state_vector(), Err(CoreError::Disposed));
        assert_eq!(
            binding.apply_remote(&[0, 0], &Document::default()),
            Err(CoreError::Disposed)
        );
    }
}
