//! Inbound RRef message handling.
//!
//! [`RRefRequestHandler`] applies the messages other workers send to an
//! owner: creation notices, fork registration and release, and value
//! fetches. It is the [`RequestHandler`] a worker's agent dispatches to.

use crate::agent::{RequestHandler, RpcError};
use crate::context::RRefContext;
use crate::types::{DistributedError, DistributedResult};
use async_trait::async_trait;
use rref_core::message::{Message, MessageType, RRefCreatePayload, RRefForkData};
use rref_core::types::WorkerId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Applies RRef protocol messages to a worker's [`RRefContext`].
///
/// Holds the context weakly: the agent owns the handler and the context owns
/// the agent, so a strong reference would keep all three alive forever.
pub struct RRefRequestHandler<T> {
    context: Weak<RRefContext<T>>,
}

impl<T> RRefRequestHandler<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(context: &Arc<RRefContext<T>>) -> Arc<Self> {
        Arc::new(Self {
            context: Arc::downgrade(context),
        })
    }

    async fn apply(&self, from: &WorkerId, message: &Message) -> DistributedResult<Option<Message>> {
        let context = self
            .context
            .upgrade()
            .ok_or(DistributedError::Rpc(RpcError::Shutdown))?;

        match message.message_type() {
            MessageType::RRefCreate => {
                let payload: RRefCreatePayload = message.decode()?;
                let value: Option<T> = payload.value.map(serde_json::from_value).transpose()?;
                let owner = context.resolve_owner(&payload.fork)?;
                if let Some(value) = value {
                    if owner.set_value(value).is_err() {
                        trace!("Value of {} was already set", owner.id());
                    }
                }
                context.add_fork_data(&payload.fork)?;
                debug!("{} registered {} created by {}", context.worker_id(), owner.id(), from);
                Ok(Some(Message::ack()))
            }
            MessageType::RRefAddFork => {
                context.add_fork(message.payload())?;
                Ok(Some(Message::ack()))
            }
            MessageType::RRefDelFork => {
                context.del_fork(message.payload())?;
                Ok(Some(Message::ack()))
            }
            MessageType::RRefFetch => {
                let fork = RRefForkData::from_payload(message.payload())?;
                let owner = context.resolve_owner(&fork)?;
                // Do not keep the registry alive while waiting for the value.
                drop(context);
                let value = owner.wait_value().await;
                Ok(Some(Message::encode(MessageType::RRefFetchRet, value)?))
            }
            MessageType::Shutdown => {
                debug!("{} is shutting down", from);
                Ok(None)
            }
            other => Err(DistributedError::UnexpectedReply(other)),
        }
    }
}

#[async_trait]
impl<T> RequestHandler for RRefRequestHandler<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn handle(&self, from: &WorkerId, message: Message) -> Option<Message> {
        match self.apply(from, &message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Failed to handle {:?} from {}: {}", message.message_type(), from, e);
                message.is_request().then(|| Message::exception(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rref_core::types::{ForkId, RRefId};
    use std::time::Duration;

    fn setup() -> (Arc<RRefContext<String>>, Arc<RRefRequestHandler<String>>) {
        let context = Arc::new(RRefContext::new(WorkerId::new("w0", 0)));
        let handler = RRefRequestHandler::new(&context);
        (context, handler)
    }

    fn w1() -> WorkerId {
        WorkerId::new("w1", 1)
    }

    fn fork() -> RRefForkData {
        RRefForkData::new(WorkerId::new("w0", 0), RRefId::new(1, 7), ForkId::new(1, 3))
    }

    #[tokio::test]
    async fn test_create_registers_owner_and_fork() {
        let (context, handler) = setup();
        let payload = RRefCreatePayload {
            fork: fork(),
            value: Some(serde_json::json!("hello")),
        };
        let message = Message::encode(MessageType::RRefCreate, &payload).unwrap();

        let reply = handler.handle(&w1(), message).await.unwrap();
        assert_eq!(reply.message_type(), MessageType::Ack);

        let owner = context.owner_rref(RRefId::new(1, 7)).unwrap();
        assert_eq!(owner.value().map(String::as_str), Some("hello"));
        assert!(context.forks_of(RRefId::new(1, 7)).contains(&ForkId::new(1, 3)));
    }

    #[tokio::test]
    async fn test_del_fork_message() {
        let (context, handler) = setup();
        context.add_fork_data(&fork()).unwrap();

        let message = Message::new(MessageType::RRefDelFork, fork().to_payload().unwrap());
        let reply = handler.handle(&w1(), message).await.unwrap();

        assert_eq!(reply.message_type(), MessageType::Ack);
        assert_eq!(context.fork_count(RRefId::new(1, 7)), 0);
    }

    #[tokio::test]
    async fn test_fetch_waits_for_value() {
        let (context, handler) = setup();
        let message = Message::new(MessageType::RRefFetch, fork().to_payload().unwrap());

        let fetch = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle(&w1(), message).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fetch.is_finished());

        context
            .get_or_create_owner_rref(RRefId::new(1, 7))
            .set_value("late".to_string())
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), fetch)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type(), MessageType::RRefFetchRet);
        assert_eq!(reply.decode::<String>().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_errors_become_exceptions() {
        let (_context, handler) = setup();
        let foreign = RRefForkData::new(w1(), RRefId::new(1, 7), ForkId::new(0, 3));
        let message = Message::new(MessageType::RRefAddFork, foreign.to_payload().unwrap());

        let reply = handler.handle(&w1(), message).await.unwrap();
        let text = reply.exception_text().unwrap();
        assert!(text.contains("owned by worker 1"), "{}", text);

        let garbage = Message::new(MessageType::RRefDelFork, b"{}".to_vec());
        let reply = handler.handle(&w1(), garbage).await.unwrap();
        assert!(reply.exception_text().unwrap().starts_with("Invalid payload"));
    }

    #[tokio::test]
    async fn test_undecodable_value_leaves_no_entry() {
        let (context, handler) = setup();
        let payload = RRefCreatePayload {
            fork: fork(),
            value: Some(serde_json::json!(42)),
        };
        let message = Message::encode(MessageType::RRefCreate, &payload).unwrap();

        let reply = handler.handle(&w1(), message).await.unwrap();
        assert_eq!(reply.message_type(), MessageType::Exception);
        assert_eq!(context.owner_count(), 0);
        assert!(context.forks_of(RRefId::new(1, 7)).is_empty());
    }

    #[tokio::test]
    async fn test_messages_for_evicted_rref() {
        let (context, handler) = setup();
        context.add_fork_data(&fork()).unwrap();
        context.del_fork_data(&fork()).unwrap();
        assert_eq!(context.evict_unreferenced(), 1);

        let add = Message::new(MessageType::RRefAddFork, fork().to_payload().unwrap());
        let reply = handler.handle(&w1(), add).await.unwrap();
        assert_eq!(reply.message_type(), MessageType::Ack);
        assert_eq!(context.owner_count(), 0);

        // A fetch fails instead of waiting on an empty entry.
        let fetch = Message::new(MessageType::RRefFetch, fork().to_payload().unwrap());
        let reply = tokio::time::timeout(Duration::from_secs(5), handler.handle(&w1(), fetch))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.exception_text().unwrap().contains("RRefId(1, 7)"));
        assert_eq!(context.owner_count(), 0);
    }

    #[tokio::test]
    async fn test_one_way_messages_get_no_reply() {
        let (_context, handler) = setup();
        assert!(handler.handle(&w1(), Message::shutdown()).await.is_none());
        assert!(handler.handle(&w1(), Message::ack()).await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_context() {
        let (context, handler) = setup();
        drop(context);

        let message = Message::new(MessageType::RRefAddFork, fork().to_payload().unwrap());
        let reply = handler.handle(&w1(), message).await.unwrap();
        assert_eq!(reply.message_type(), MessageType::Exception);
    }
}
