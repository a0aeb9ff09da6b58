use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use lightning::ln::types::PaymentPreimage;
use ln_trampoline_policy::{FailureMessage, HtlcRef};
use tokio::sync::Mutex;

use crate::BoxError;

/// A settlement command for one upstream htlc. Commands are idempotent, keyed by the htlc
/// reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayCommand {
    Fail {
        htlc: HtlcRef,
        reason: FailureMessage,
    },
    Fulfill {
        htlc: HtlcRef,
        preimage: PaymentPreimage,
    },
}

impl RelayCommand {
    pub fn htlc_ref(&self) -> HtlcRef {
        match self {
            RelayCommand::Fail { htlc, .. } => *htlc,
            RelayCommand::Fulfill { htlc, .. } => *htlc,
        }
    }
}

/// The channel layer's command register. Commands are committed to the channel state machine
/// owning the htlc; `commit` requests an immediate commitment signature.
#[async_trait]
pub trait ChannelRegister: Send + Sync {
    async fn fail_htlc(
        &self,
        htlc: HtlcRef,
        reason: FailureMessage,
        commit: bool,
    ) -> Result<(), BoxError>;

    async fn fulfill_htlc(
        &self,
        htlc: HtlcRef,
        preimage: PaymentPreimage,
        commit: bool,
    ) -> Result<(), BoxError>;
}

/// Write-ahead storage for settlement commands. Commands stay stored until the channel layer
/// confirms them, and are replayed at startup so that no settlement is lost across restarts.
#[async_trait]
pub trait PendingCommandStore: Send + Sync {
    /// Stores a command. Persisting the same command again is a no-op.
    async fn persist(&self, command: &RelayCommand) -> Result<(), BoxError>;

    /// Drops the command for the htlc, once the channel layer has irrevocably committed it.
    async fn remove(&self, htlc: HtlcRef) -> Result<(), BoxError>;

    /// Lists commands that have not been confirmed by the channel layer yet.
    async fn list_pending(&self) -> Result<Vec<RelayCommand>, BoxError>;
}

/// Sends a settlement command on the durable path: persist first, then dispatch to the channel
/// register. Neither step propagates errors to the relay; the stored command is the retry
/// source and will be replayed at the next startup if dispatch did not go through.
pub async fn safe_send(
    store: &dyn PendingCommandStore,
    register: &dyn ChannelRegister,
    command: RelayCommand,
) {
    if let Err(e) = store.persist(&command).await {
        log::error!(
            "failed to persist relay command for htlc {}: {e}",
            command.htlc_ref()
        );
    }

    if let Err(e) = dispatch(register, &command).await {
        log::warn!(
            "channel register rejected command for htlc {}: {e}",
            command.htlc_ref()
        );
    }
}

/// Replays every stored command that the channel layer has not confirmed, returning how many
/// were dispatched. Called once at node startup.
pub async fn replay_pending(
    store: &dyn PendingCommandStore,
    register: &dyn ChannelRegister,
) -> Result<usize, BoxError> {
    let pending = store.list_pending().await?;
    let count = pending.len();

    for command in pending {
        if let Err(e) = dispatch(register, &command).await {
            log::warn!(
                "channel register rejected replayed command for htlc {}: {e}",
                command.htlc_ref()
            );
        }
    }

    Ok(count)
}

async fn dispatch(register: &dyn ChannelRegister, command: &RelayCommand) -> Result<(), BoxError> {
    match command {
        RelayCommand::Fail { htlc, reason } => {
            register.fail_htlc(*htlc, reason.clone(), true).await
        }
        RelayCommand::Fulfill { htlc, preimage } => {
            register.fulfill_htlc(*htlc, *preimage, true).await
        }
    }
}

/// In-memory reference implementation of the command store.
#[derive(Default)]
pub struct MemoryCommandStore {
    commands: Mutex<HashMap<HtlcRef, RelayCommand>>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingCommandStore for MemoryCommandStore {
    async fn persist(&self, command: &RelayCommand) -> Result<(), BoxError> {
        match self.commands.lock().await.entry(command.htlc_ref()) {
            // First command for a htlc wins; re-persisting is a no-op.
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(v) => {
                v.insert(command.clone());
                Ok(())
            }
        }
    }

    async fn remove(&self, htlc: HtlcRef) -> Result<(), BoxError> {
        self.commands.lock().await.remove(&htlc);
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<RelayCommand>, BoxError> {
        Ok(self.commands.lock().await.values().cloned().collect())
    }
}
