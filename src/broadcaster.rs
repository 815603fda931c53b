use crate::error::RpcError;
use crate::operation_log::OperationLog;
use crate::rpc::LedgerRpc;
use crate::signer::SignedTransaction;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Hands signed transactions to the network. One attempt per transaction;
/// the caller decides whether to resubmit.
pub struct Broadcaster {
    rpc: Arc<dyn LedgerRpc>,
    journal: Option<OperationLog>,
}

impl Broadcaster {
    pub fn new(rpc: Arc<dyn LedgerRpc>) -> Self {
        Self { rpc, journal: None }
    }

    pub fn with_journal(mut self, journal: OperationLog) -> Self {
        self.journal = Some(journal);
        self
    }

    pub async fn submit(&self, tx: &SignedTransaction) -> Result<String, RpcError> {
        let intent = tx.intent();
        info!("Submitting {} from {} to {}", tx.tx_hash(), intent.from, intent.to);

        let hash = match self.rpc.send_transaction(tx).await {
            Ok(hash) => hash,
            Err(e) => {
                error!("Submission of {} failed: {}", tx.tx_hash(), e);
                return Err(e);
            }
        };
        info!("Transaction accepted: {}", hash);

        if let Some(journal) = &self.journal {
            let operation = if intent.is_call() { "call_contract" } else { "send_icx" };
            let mut details = format!("from={}\nto={}\n", intent.from, intent.to);
            if let Some(value) = intent.value {
                details.push_str(&format!("value={} ICX\n", crate::utils::loop_to_icx(value)));
            }
            if let Some(data) = &intent.data {
                details.push_str(&format!("method={}\n", data.method));
            }
            details.push_str(&format!("hash={}", hash));
            if let Err(e) = journal.append(operation, intent.nid, details) {
                warn!("Could not write operation log: {}", e);
            }
        }
        Ok(hash)
    }
}
