//! Recovery chain for failed API calls.
//!
//! When a call fails, each registered [`ErrorHandler`] is offered the call
//! and the error in ascending priority order. The first handler that returns
//! a substitute result wins and the caller sees success; if none does, the
//! original error propagates. This is how offline-first behavior is layered
//! onto calls without changing their contract (see [`offline`]).

pub mod offline;

use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use tether_core::{
    ChatError,
    message::OutboundMessage,
    model::{Channel, Member, Reaction},
};
use tracing::{debug, info};

/// A domain call that may be recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// Create a channel (or get it if it exists)
    CreateChannel {
        /// Channel id, `type:id`
        cid: String,
        /// Initial members
        member_ids: Vec<String>,
    },
    /// Add a reaction
    SendReaction(Reaction),
    /// Remove a reaction
    DeleteReaction {
        /// Reacted-to message
        message_id: String,
        /// Reacting user
        user_id: String,
        /// Reaction type
        kind: String,
    },
    /// Page through a channel's members
    QueryMembers {
        /// Channel id
        cid: String,
        /// Members to skip
        offset: usize,
        /// Page size
        limit: usize,
    },
    /// Send a message
    SendMessage(OutboundMessage),
}

/// Successful result of a [`Call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutput {
    /// Result of `CreateChannel`
    Channel(Channel),
    /// Result of `SendReaction` and `DeleteReaction`
    Reaction(Reaction),
    /// Result of `QueryMembers`
    Members(Vec<Member>),
    /// Result of `SendMessage`
    Message(OutboundMessage),
}

/// One recovery strategy.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Substitute result for `call` after `error`, or `None` to pass.
    async fn on_error(&self, call: &Call, error: &ChatError) -> Option<CallOutput>;
}

/// Handlers ordered by ascending priority. Equal priorities keep
/// registration order.
#[derive(Clone, Default)]
pub struct ErrorHandlerChain {
    handlers: Vec<Arc<dyn ErrorHandler>>,
}

impl fmt::Debug for ErrorHandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.handlers.iter().map(|h| (h.name(), h.priority()))).finish()
    }
}

impl ErrorHandlerChain {
    /// Chain over `handlers`.
    pub fn new(handlers: Vec<Arc<dyn ErrorHandler>>) -> Self {
        let mut chain = Self { handlers };
        chain.handlers.sort_by_key(|h| h.priority());
        chain
    }

    /// Add a handler at its priority position, after existing handlers with
    /// the same priority.
    pub fn push(&mut self, handler: Arc<dyn ErrorHandler>) {
        let at = self.handlers.partition_point(|h| h.priority() <= handler.priority());
        self.handlers.insert(at, handler);
    }

    /// Registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Offer `call` and `error` to each handler; first substitute wins.
    pub async fn recover(&self, call: &Call, error: &ChatError) -> Option<CallOutput> {
        for handler in &self.handlers {
            if let Some(output) = handler.on_error(call, error).await {
                info!(handler = handler.name(), %error, "call recovered");
                return Some(output);
            }
            debug!(handler = handler.name(), "handler passed");
        }
        None
    }

    /// Run `request`; on failure try to recover, else return the error.
    pub async fn execute<F>(&self, call: Call, request: F) -> Result<CallOutput, ChatError>
    where
        F: Future<Output = Result<CallOutput, ChatError>> + Send,
    {
        match request.await {
            Ok(output) => Ok(output),
            Err(error) => self.recover(&call, &error).await.ok_or(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct Recording {
        name: &'static str,
        priority: i32,
        answer: Option<CallOutput>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ErrorHandler for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn on_error(&self, _call: &Call, _error: &ChatError) -> Option<CallOutput> {
            self.log.lock().push(self.name);
            self.answer.clone()
        }
    }

    fn handler(
        name: &'static str,
        priority: i32,
        answer: Option<CallOutput>,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn ErrorHandler> {
        Arc::new(Recording { name, priority, answer, log: Arc::clone(log) })
    }

    fn members_call() -> Call {
        Call::QueryMembers { cid: "messaging:general".into(), offset: 0, limit: 10 }
    }

    #[tokio::test]
    async fn handlers_run_in_priority_order_until_one_recovers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ErrorHandlerChain::new(vec![
            handler("late", 50, Some(CallOutput::Members(vec![])), &log),
            handler("early", -10, None, &log),
        ]);
        chain.push(handler("middle", 0, None, &log));
        chain.push(handler("never", 50, None, &log));

        let output = chain.recover(&members_call(), &ChatError::Offline).await;
        assert_eq!(output, Some(CallOutput::Members(vec![])));
        assert_eq!(*log.lock(), vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn execute_propagates_unrecovered_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ErrorHandlerChain::new(vec![handler("pass", 0, None, &log)]);

        let result = chain
            .execute(members_call(), async { Err(ChatError::Network("reset".into())) })
            .await;
        assert_eq!(result, Err(ChatError::Network("reset".into())));

        let ok = chain.execute(members_call(), async { Ok(CallOutput::Members(vec![])) }).await;
        assert!(ok.is_ok());
        assert_eq!(log.lock().len(), 1);
    }
}
