//! Transaction event feed.

use palisade_types::SignedTransaction;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Fan-out of admitted transactions to subscribers. Closed receivers
/// are dropped on the next send.
#[derive(Default)]
pub(crate) struct TxFeed {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<SignedTransaction>>>>,
}

impl TxFeed {
    pub fn subscribe(&self, ch: mpsc::UnboundedSender<Vec<SignedTransaction>>) {
        self.subscribers.lock().expect("feed lock").push(ch);
    }

    pub fn send(&self, txs: Vec<SignedTransaction>) {
        if txs.is_empty() {
            return;
        }
        self.subscribers
            .lock()
            .expect("feed lock")
            .retain(|ch| ch.send(txs.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::test_utils::{test_key, test_tx};

    #[tokio::test]
    async fn fan_out_and_cleanup() {
        let feed = TxFeed::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        feed.subscribe(tx1);
        feed.subscribe(tx2);
        drop(rx2);

        let key = test_key(1);
        feed.send(vec![test_tx(&key, 1)]);
        assert_eq!(rx1.recv().await.unwrap().len(), 1);
        assert_eq!(feed.subscribers.lock().unwrap().len(), 1);
    }
}
