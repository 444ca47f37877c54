use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::LedgerConfig;
use crate::ledger::{
  AccountCommand, AccountId, AccountOutcome, AccountReply, Delivery, DeliveryId, Money,
  TransferEvent, TransferId, TransferNotification, TransferRejection, TransferState, TransferStatus,
};
use crate::store::{self, Journal};

use super::{AccountMessage, Directory, LedgerError, Result, TransferStore};

/// Unconfirmed deliveries are reported every this many attempts.
const REDELIVERY_WARNING_ATTEMPTS: u32 = 10;

pub fn transfer_persistence_id(transfer_id: &TransferId) -> String {
  format!("transfer-{}", transfer_id)
}

/// Request to move `amount` from the `debtor` to the `creditor`.
/// Progress is reported to `requester`.
#[derive(Debug)]
pub struct ExecuteTransfer {
  pub amount: Money,
  pub creditor: AccountId,
  pub debtor: AccountId,
  pub requester: mpsc::UnboundedSender<TransferNotification>,
}

#[derive(Debug, Clone)]
pub struct TransferHandle {
  transfer_id: TransferId,
  sender: mpsc::UnboundedSender<ExecuteTransfer>,
}

impl TransferHandle {
  /// Ask the saga to execute the transfer. The returned channel yields its notifications,
  /// and it closes once the saga has nothing else to say.
  pub fn execute(
    &self,
    amount: Money,
    creditor: AccountId,
    debtor: AccountId,
  ) -> Result<mpsc::UnboundedReceiver<TransferNotification>> {
    let (requester, notifications) = mpsc::unbounded_channel();
    self
      .sender
      .send(ExecuteTransfer {
        amount,
        creditor,
        debtor,
        requester,
      })
      .map_err(|_| LedgerError::TransferUnavailable(self.transfer_id.clone()))?;
    Ok(notifications)
  }

  /// Whether the saga task has stopped.
  pub fn is_stopped(&self) -> bool {
    self.sender.is_closed()
  }
}

/// Start a transfer saga. It recovers from `store`, resumes any delivery left unconfirmed,
/// and stops once it is finished.
pub fn spawn_transfer<S: TransferStore>(
  transfer_id: TransferId,
  store: Arc<S>,
  directory: Arc<dyn Directory>,
  config: LedgerConfig,
) -> TransferHandle {
  let (sender, inbox) = mpsc::unbounded_channel();
  let (reply_to, replies) = mpsc::unbounded_channel();
  let mailbox = Mailbox {
    inbox,
    inbox_open: true,
    reply_to,
    replies,
    requester: None,
  };
  tokio::spawn(run(transfer_id.clone(), store, directory, config, mailbox));
  TransferHandle {
    transfer_id,
    sender,
  }
}

/// Channels of a saga. They outlive restarts, so replies to deliveries sent
/// before a restart still reach the recovered saga.
struct Mailbox {
  inbox: mpsc::UnboundedReceiver<ExecuteTransfer>,
  inbox_open: bool,
  reply_to: mpsc::UnboundedSender<AccountReply>,
  replies: mpsc::UnboundedReceiver<AccountReply>,
  requester: Option<mpsc::UnboundedSender<TransferNotification>>,
}

impl Mailbox {
  /// The requester is let go after a terminal notification, closing its channel.
  fn notify(&mut self, notification: TransferNotification) {
    let terminal = notification.is_terminal();
    if let Some(requester) = &self.requester {
      requester.send(notification).ok();
    }
    if terminal {
      self.requester = None;
    }
  }

  fn close_inbox(&mut self) {
    self.inbox.close();
    self.inbox_open = false;
  }
}

enum Input {
  Execute(Option<ExecuteTransfer>),
  Reply(AccountReply),
  Redeliver,
}

async fn run<S: TransferStore>(
  transfer_id: TransferId,
  store: Arc<S>,
  directory: Arc<dyn Directory>,
  config: LedgerConfig,
  mut mailbox: Mailbox,
) {
  let persistence_id = transfer_persistence_id(&transfer_id);
  loop {
    let recovered = Journal::recover(
      store.clone(),
      persistence_id.clone(),
      config.snapshot_interval,
      TransferState::new(transfer_id.clone()),
    )
    .await;

    let result = match recovered {
      Ok((journal, state)) => {
        debug!(
          %transfer_id,
          sequence_nr = journal.sequence_nr(),
          status = ?state.status,
          "Transfer saga recovered"
        );
        let mut saga = Saga {
          journal,
          directory: directory.clone(),
        };
        saga
          .process(state, &mut mailbox, config.redelivery_interval)
          .await
      }
      Err(err) => Err(err),
    };

    match result {
      Ok(()) => {
        debug!(%transfer_id, "Transfer saga stopped");
        return;
      }
      Err(err) => {
        error!(%transfer_id, %err, "Transfer saga failed, recovering");
        tokio::time::sleep(config.restart_backoff).await;
      }
    }
  }
}

struct Saga<S> {
  journal: Journal<S>,
  directory: Arc<dyn Directory>,
}

impl<S: TransferStore> Saga<S> {
  async fn process(
    &mut self,
    mut state: TransferState,
    mailbox: &mut Mailbox,
    redelivery_interval: Duration,
  ) -> store::Result<()> {
    let mut redelivery = interval_at(Instant::now() + redelivery_interval, redelivery_interval);

    loop {
      if state.is_finished() {
        mailbox.close_inbox();
        return Ok(());
      }
      if state.status == TransferStatus::New && !mailbox.inbox_open {
        return Ok(());
      }

      let input = tokio::select! {
        command = mailbox.inbox.recv(), if mailbox.inbox_open => Input::Execute(command),
        Some(reply) = mailbox.replies.recv() => Input::Reply(reply),
        _ = redelivery.tick() => Input::Redeliver,
      };

      state = match input {
        Input::Execute(Some(command)) => self.execute(state, command, mailbox).await?,
        Input::Execute(None) => {
          mailbox.inbox_open = false;
          state
        }
        Input::Reply(reply) => self.on_reply(state, reply, mailbox).await?,
        Input::Redeliver => self.redeliver(state, mailbox).await,
      };
    }
  }

  async fn execute(
    &mut self,
    state: TransferState,
    command: ExecuteTransfer,
    mailbox: &mut Mailbox,
  ) -> store::Result<TransferState> {
    let ExecuteTransfer {
      amount,
      creditor,
      debtor,
      requester,
    } = command;
    let transfer_id = state.transfer_id.clone();

    match state.execute(amount, creditor, debtor) {
      Ok(events) => {
        mailbox.requester = Some(requester);
        self.persist(state, events, mailbox).await
      }
      Err(TransferRejection::AlreadyExecuted(_)) => {
        warn!(%transfer_id, "Transfer already executed, command dropped");
        Ok(state)
      }
      Err(rejection) => {
        info!(%transfer_id, %rejection, "Transfer rejected");
        requester
          .send(TransferNotification::Rejected {
            transfer_id,
            reason: rejection.to_string(),
          })
          .ok();
        mailbox.close_inbox();
        Ok(state)
      }
    }
  }

  async fn on_reply(
    &mut self,
    state: TransferState,
    reply: AccountReply,
    mailbox: &mut Mailbox,
  ) -> store::Result<TransferState> {
    if let AccountOutcome::DebitFailed { reason } = &reply.outcome {
      warn!(
        transfer_id = %state.transfer_id,
        account_id = %reply.account_id,
        delivery_id = reply.delivery_id,
        %reason,
        "Debit failed, delivery stays unconfirmed"
      );
      return Ok(state);
    }

    let events = state.on_reply(&reply);
    if events.is_empty() {
      debug!(
        transfer_id = %state.transfer_id,
        delivery_id = reply.delivery_id,
        outcome = ?reply.outcome,
        "Reply ignored"
      );
      return Ok(state);
    }
    self.persist(state, events, mailbox).await
  }

  /// Persist `events`, then act on them: dispatch the messages they send and notify the requester.
  async fn persist(
    &mut self,
    state: TransferState,
    events: Vec<TransferEvent>,
    mailbox: &mut Mailbox,
  ) -> store::Result<TransferState> {
    let mut state = self.journal.persist(state, events.clone()).await?;

    for event in events {
      if let Some(notification) = TransferNotification::from_event(&event) {
        info!(
          transfer_id = %state.transfer_id,
          event = event.name(),
          status = ?state.status,
          "Transfer progressed"
        );
        mailbox.notify(notification);
      }
      if let TransferEvent::MessageSent {
        delivery_id,
        destination,
        command,
      } = event
      {
        state.deliveries.attempted(delivery_id);
        self
          .dispatch(&destination, delivery_id, command, mailbox)
          .await;
      }
    }
    Ok(state)
  }

  async fn redeliver(&self, mut state: TransferState, mailbox: &Mailbox) -> TransferState {
    let pending: Vec<_> = state
      .deliveries
      .redeliveries()
      .map(|record| {
        (
          record.destination.clone(),
          record.delivery(),
          record.attempts,
        )
      })
      .collect();

    let unconfirmed = state.deliveries.len();
    for (destination, delivery, attempts) in pending {
      if attempts % REDELIVERY_WARNING_ATTEMPTS == 0 {
        warn!(
          transfer_id = %state.transfer_id,
          account_id = %destination,
          delivery_id = delivery.delivery_id,
          attempts,
          unconfirmed,
          "Delivery still unconfirmed"
        );
      } else {
        debug!(
          transfer_id = %state.transfer_id,
          account_id = %destination,
          delivery_id = delivery.delivery_id,
          attempts,
          "Redelivering"
        );
      }
      self
        .dispatch(&destination, delivery.delivery_id, delivery.payload, mailbox)
        .await;
    }
    state
  }

  async fn dispatch(
    &self,
    destination: &AccountId,
    delivery_id: DeliveryId,
    command: AccountCommand,
    mailbox: &Mailbox,
  ) {
    let message = AccountMessage::Deliver {
      delivery: Delivery {
        delivery_id,
        payload: command,
      },
      reply_to: mailbox.reply_to.clone(),
    };
    self.directory.forward(destination, message).await;
  }
}

#[cfg(test)]
mod tests {

  use async_trait::async_trait;
  use mockall::mock;
  use rust_decimal_macros::dec;

  use crate::ledger::{AccountOverview, Confirmation, TransferState, NOT_ENOUGH_BALANCE};
  use crate::runtime::testing::{test_config, FlakyStore};
  use crate::runtime::{AccountDirectory, InMemoryAccountStore, InMemoryTransferStore};
  use crate::store::EventStore;

  use super::*;

  mock! {
    TestDirectory {}

    #[async_trait]
    impl Directory for TestDirectory {
      async fn forward(&self, account_id: &AccountId, message: AccountMessage);
    }
  }

  struct Fixture {
    accounts: Arc<AccountDirectory<InMemoryAccountStore>>,
    store: Arc<InMemoryTransferStore>,
  }

  impl Fixture {
    fn new() -> Self {
      Self {
        accounts: Arc::new(AccountDirectory::new(
          Arc::new(InMemoryAccountStore::new()),
          test_config(),
        )),
        store: Arc::new(InMemoryTransferStore::new()),
      }
    }

    async fn open(&self, id: &str, balance: Money) {
      self
        .accounts
        .create(AccountId::new(id), id.to_string(), balance)
        .await
        .unwrap();
    }

    fn spawn(&self, transfer_id: &str) -> TransferHandle {
      spawn_transfer(
        TransferId::new(transfer_id),
        self.store.clone(),
        self.accounts.clone(),
        test_config(),
      )
    }

    async fn balances(&self, id: &str) -> (Money, Money) {
      let overview = self.accounts.overview(&AccountId::new(id)).await.unwrap();
      (overview.balance, overview.allocated_balance)
    }
  }

  async fn collect(
    mut notifications: mpsc::UnboundedReceiver<TransferNotification>,
  ) -> Vec<TransferNotification> {
    let mut received = Vec::new();
    while let Some(notification) = notifications.recv().await {
      let terminal = notification.is_terminal();
      received.push(notification);
      if terminal {
        break;
      }
    }
    received
  }

  async fn wait_until_stopped(handle: &TransferHandle) {
    while !handle.is_stopped() {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  }

  #[tokio::test]
  async fn successful_transfer() {
    let fixture = Fixture::new();
    fixture.open("A", dec!(10)).await;
    fixture.open("B", dec!(0)).await;

    let handle = fixture.spawn("T1");
    let notifications = handle
      .execute(dec!(5), AccountId::new("B"), AccountId::new("A"))
      .unwrap();

    assert_eq!(
      collect(notifications).await,
      vec![
        TransferNotification::Initiated {
          transfer_id: TransferId::new("T1"),
          debtor: AccountId::new("A"),
          creditor: AccountId::new("B"),
          amount: dec!(5),
        },
        TransferNotification::Completed {
          transfer_id: TransferId::new("T1"),
          debtor: AccountId::new("A"),
          creditor: AccountId::new("B"),
          amount: dec!(5),
        },
      ]
    );

    wait_until_stopped(&handle).await;
    assert_eq!(fixture.balances("A").await, (dec!(5), dec!(0)));
    assert_eq!(fixture.balances("B").await, (dec!(5), dec!(0)));
  }

  #[tokio::test]
  async fn not_enough_balance() {
    let fixture = Fixture::new();
    fixture.open("A", dec!(10)).await;
    fixture.open("B", dec!(0)).await;

    let handle = fixture.spawn("T1");
    let notifications = handle
      .execute(dec!(15), AccountId::new("B"), AccountId::new("A"))
      .unwrap();

    assert_eq!(
      collect(notifications).await.last(),
      Some(&TransferNotification::Failed {
        transfer_id: TransferId::new("T1"),
        debtor: AccountId::new("A"),
        creditor: AccountId::new("B"),
        amount: dec!(15),
        reason: NOT_ENOUGH_BALANCE.to_string(),
      })
    );

    wait_until_stopped(&handle).await;
    assert_eq!(fixture.balances("A").await, (dec!(10), dec!(0)));
    assert_eq!(fixture.balances("B").await, (dec!(0), dec!(0)));
  }

  #[tokio::test]
  async fn allocated_money_is_not_available() {
    let fixture = Fixture::new();
    fixture.open("D", dec!(10)).await;
    fixture.open("C", dec!(1)).await;

    let (reply_to, mut replies) = mpsc::unbounded_channel();
    let allocate = AccountCommand::AllocateMoney {
      transfer_id: TransferId::new("T0"),
      creditor: AccountId::new("C"),
      amount: dec!(6),
    };
    fixture
      .accounts
      .forward(
        &AccountId::new("D"),
        AccountMessage::Deliver {
          delivery: Delivery {
            delivery_id: 1,
            payload: allocate,
          },
          reply_to,
        },
      )
      .await;
    assert_eq!(
      replies.recv().await.unwrap().outcome,
      AccountOutcome::MoneyAllocated { amount: dec!(6) }
    );

    let handle = fixture.spawn("T1");
    let notifications = handle
      .execute(dec!(5), AccountId::new("C"), AccountId::new("D"))
      .unwrap();

    assert_eq!(
      collect(notifications).await.last(),
      Some(&TransferNotification::Failed {
        transfer_id: TransferId::new("T1"),
        debtor: AccountId::new("D"),
        creditor: AccountId::new("C"),
        amount: dec!(5),
        reason: NOT_ENOUGH_BALANCE.to_string(),
      })
    );
    wait_until_stopped(&handle).await;

    assert_eq!(
      fixture.accounts.overview(&AccountId::new("D")).await,
      Ok(AccountOverview {
        balance: dec!(10),
        allocated_balance: dec!(6),
        pending_transfers: 1,
      })
    );
    assert_eq!(
      fixture.accounts.overview(&AccountId::new("C")).await,
      Ok(AccountOverview {
        balance: dec!(1),
        allocated_balance: dec!(0),
        pending_transfers: 0,
      })
    );
  }

  #[tokio::test]
  async fn requester_channel_closes_after_the_outcome() {
    let fixture = Fixture::new();
    fixture.open("A", dec!(10)).await;
    fixture.open("B", dec!(0)).await;

    let handle = fixture.spawn("T1");
    let mut notifications = handle
      .execute(dec!(1), AccountId::new("B"), AccountId::new("A"))
      .unwrap();

    let mut received = Vec::new();
    while let Some(notification) = notifications.recv().await {
      received.push(notification);
    }
    assert_eq!(received.len(), 2);
    assert!(matches!(
      received.last(),
      Some(TransferNotification::Completed { .. })
    ));
  }

  #[tokio::test]
  async fn self_transfer_is_rejected_without_contacting_accounts() {
    let mut directory = MockTestDirectory::new();
    directory.expect_forward().never();
    let store = Arc::new(InMemoryTransferStore::new());

    let handle = spawn_transfer(
      TransferId::new("T1"),
      store.clone(),
      Arc::new(directory),
      test_config(),
    );
    let notifications = handle
      .execute(dec!(5), AccountId::new("A"), AccountId::new("A"))
      .unwrap();

    assert_eq!(
      collect(notifications).await,
      vec![TransferNotification::Rejected {
        transfer_id: TransferId::new("T1"),
        reason: TransferRejection::SelfTransfer(AccountId::new("A")).to_string(),
      }]
    );
    wait_until_stopped(&handle).await;
    assert_eq!(store.highest_sequence_nr("transfer-T1").await.unwrap(), 0);
  }

  #[tokio::test]
  async fn redelivers_until_the_creditor_exists() {
    let fixture = Fixture::new();
    fixture.open("A", dec!(10)).await;

    let handle = fixture.spawn("T1");
    let mut notifications = handle
      .execute(dec!(4), AccountId::new("B"), AccountId::new("A"))
      .unwrap();
    assert!(matches!(
      notifications.recv().await,
      Some(TransferNotification::Initiated { .. })
    ));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fixture.balances("A").await, (dec!(6), dec!(0)));

    fixture.open("B", dec!(1)).await;

    assert!(matches!(
      notifications.recv().await,
      Some(TransferNotification::Completed { .. })
    ));
    wait_until_stopped(&handle).await;
    assert_eq!(fixture.balances("B").await, (dec!(5), dec!(0)));
  }

  #[tokio::test]
  async fn second_execute_is_dropped() {
    let fixture = Fixture::new();
    fixture.open("A", dec!(10)).await;
    fixture.open("B", dec!(0)).await;

    let handle = fixture.spawn("T1");
    let first = handle
      .execute(dec!(5), AccountId::new("B"), AccountId::new("A"))
      .unwrap();
    let second = handle.execute(dec!(5), AccountId::new("B"), AccountId::new("A"));

    assert!(matches!(
      collect(first).await.last(),
      Some(TransferNotification::Completed { .. })
    ));
    if let Ok(second) = second {
      assert_eq!(collect(second).await, vec![]);
    }
    wait_until_stopped(&handle).await;
    assert_eq!(fixture.balances("A").await, (dec!(5), dec!(0)));
  }

  #[tokio::test]
  async fn resumes_a_saga_recovered_from_the_store() {
    let fixture = Fixture::new();
    fixture.open("A", dec!(10)).await;
    fixture.open("B", dec!(0)).await;

    let transfer_id = TransferId::new("T1");
    let events = TransferState::new(transfer_id.clone())
      .execute(dec!(3), AccountId::new("B"), AccountId::new("A"))
      .unwrap();
    fixture
      .store
      .append("transfer-T1", 0, &events)
      .await
      .unwrap();

    let handle = fixture.spawn("T1");
    wait_until_stopped(&handle).await;

    assert_eq!(fixture.balances("A").await, (dec!(7), dec!(0)));
    assert_eq!(fixture.balances("B").await, (dec!(3), dec!(0)));
    let recorded: Vec<_> = fixture
      .store
      .replay("transfer-T1", 0)
      .await
      .unwrap()
      .into_iter()
      .map(|envelope| envelope.event.name())
      .collect();
    assert_eq!(recorded.last(), Some(&"TransferCompleted"));
  }

  #[tokio::test]
  async fn recovers_after_a_failed_append() {
    let fixture = Fixture::new();
    fixture.open("A", dec!(10)).await;
    fixture.open("B", dec!(0)).await;
    let store = Arc::new(FlakyStore::<TransferEvent, TransferState>::failing(0));

    let handle = spawn_transfer(
      TransferId::new("T1"),
      store.clone(),
      fixture.accounts.clone(),
      test_config(),
    );
    let mut notifications = handle
      .execute(dec!(2), AccountId::new("B"), AccountId::new("A"))
      .unwrap();
    assert!(matches!(
      notifications.recv().await,
      Some(TransferNotification::Initiated { .. })
    ));
    // loses the confirmation of the allocation, which then comes back through redelivery
    store.fail_next_appends(1);

    assert!(matches!(
      collect(notifications).await.last(),
      Some(TransferNotification::Completed { .. })
    ));
    wait_until_stopped(&handle).await;
    assert_eq!(fixture.balances("A").await, (dec!(8), dec!(0)));
    assert_eq!(fixture.balances("B").await, (dec!(2), dec!(0)));

    let confirmations = store
      .replay("transfer-T1", 0)
      .await
      .unwrap()
      .into_iter()
      .filter(|envelope| {
        matches!(
          envelope.event,
          TransferEvent::MessageConfirmed {
            confirmation: Confirmation::MoneyAllocated,
            ..
          }
        )
      })
      .count();
    assert_eq!(confirmations, 1);
  }
}
