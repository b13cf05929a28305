//! Work queue between discovery and the workers.
//!
//! Delivery is at-least-once with a prefetch of one: a delivered message
//! stays in flight until it is acknowledged, and nothing else is handed out
//! meanwhile. A released message goes back to the head of the queue.

use crate::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};
use tokio::sync::Notify;

pub const QUEUE_NAME: &str = "repositories";

/// Body of a message of the `repositories` queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMessage {
    pub repo_name: String,
}

impl RepositoryMessage {
    pub fn new<S: Into<String>>(repo_name: S) -> Self {
        Self {
            repo_name: repo_name.into(),
        }
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_body(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    /// Append a message to the tail of the queue
    async fn publish(&self, body: Vec<u8>) -> Result<()>;

    /// Wait for the next message. Returns `None` once the queue is closed.
    async fn next(&self) -> Option<Delivery>;

    async fn ack(&self, tag: u64) -> Result<()>;

    /// Give an unacknowledged message back for redelivery
    async fn release(&self, tag: u64) -> Result<()>;

    async fn close(&self);
}

pub async fn publish_repository(queue: &dyn Queue, repo_name: &str) -> Result<()> {
    debug!("Publishing {} to {}", repo_name, QUEUE_NAME);
    queue.publish(RepositoryMessage::new(repo_name).to_body()?).await
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Vec<u8>>,
    in_flight: Option<Delivery>,
    next_tag: u64,
    closed: bool,
}

/// In-process `Queue`. Messages do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Messages waiting to be delivered
    pub fn len(&self) -> usize {
        self.state().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_in_flight(&self, tag: u64) -> Result<Delivery> {
        let mut state = self.state();
        match state.in_flight.take() {
            Some(delivery) if delivery.tag == tag => Ok(delivery),
            other => {
                state.in_flight = other;
                Err(format!("unknown delivery tag {}", tag).into())
            }
        }
    }
}

#[async_trait::async_trait]
impl Queue for MemoryQueue {
    async fn publish(&self, body: Vec<u8>) -> Result<()> {
        {
            let mut state = self.state();
            if state.closed {
                return Err("queue is closed".into());
            }
            state.ready.push_back(body);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn next(&self) -> Option<Delivery> {
        loop {
            // Registered before looking at the state so that a wakeup sent in
            // between is not lost
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if state.in_flight.is_none() {
                    if let Some(body) = state.ready.pop_front() {
                        state.next_tag += 1;
                        let delivery = Delivery {
                            tag: state.next_tag,
                            body,
                        };
                        state.in_flight = Some(delivery.clone());
                        return Some(delivery);
                    }
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.take_in_flight(tag)?;
        self.notify.notify_one();
        Ok(())
    }

    async fn release(&self, tag: u64) -> Result<()> {
        let delivery = self.take_in_flight(tag)?;
        self.state().ready.push_front(delivery.body);
        self.notify.notify_one();
        Ok(())
    }

    async fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod test {
    use super::{publish_repository, MemoryQueue, Queue, RepositoryMessage};
    use std::{sync::Arc, time::Duration};

    #[test]
    fn message_body() {
        let body = RepositoryMessage::new("octocat/hello-world").to_body().unwrap();
        assert_eq!(body, br#"{"repo_name":"octocat/hello-world"}"#);
        assert!(RepositoryMessage::from_body(b"{\"repo\": 1}").is_err());
    }

    #[tokio::test]
    async fn one_message_in_flight_until_acked() {
        let queue = MemoryQueue::new();
        publish_repository(&queue, "octocat/a").await.unwrap();
        publish_repository(&queue, "octocat/b").await.unwrap();

        let first = queue.next().await.unwrap();
        assert_eq!(
            RepositoryMessage::from_body(&first.body).unwrap().repo_name,
            "octocat/a"
        );
        assert!(tokio::time::timeout(Duration::from_millis(20), queue.next())
            .await
            .is_err());

        queue.ack(first.tag).await.unwrap();
        assert!(queue.ack(first.tag).await.is_err());
        let second = queue.next().await.unwrap();
        assert_eq!(
            RepositoryMessage::from_body(&second.body).unwrap().repo_name,
            "octocat/b"
        );
    }

    #[tokio::test]
    async fn released_message_is_redelivered_first() {
        let queue = MemoryQueue::new();
        queue.publish(b"a".to_vec()).await.unwrap();
        queue.publish(b"b".to_vec()).await.unwrap();

        let first = queue.next().await.unwrap();
        queue.release(first.tag).await.unwrap();
        assert_eq!(queue.len(), 2);

        let again = queue.next().await.unwrap();
        assert_eq!(again.body, b"a");
        assert_ne!(again.tag, first.tag);
    }

    #[tokio::test]
    async fn close_wakes_up_consumers() {
        let queue = Arc::new(MemoryQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.close().await;
        assert_eq!(consumer.await.unwrap(), None);
        assert!(queue.publish(b"late".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn publish_wakes_up_a_waiting_consumer() {
        let queue = Arc::new(MemoryQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.publish(b"a".to_vec()).await.unwrap();
        let delivery = consumer.await.unwrap().unwrap();
        assert_eq!(delivery.body, b"a");
        assert!(queue.is_empty());
    }
}
