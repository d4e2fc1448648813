//! The dispatch-engine boundary.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::RelayError;

/// Stream of values produced by a subscription procedure.
pub type ValueStream = BoxStream<'static, Result<Value, RelayError>>;

/// The three procedure shapes the engine can execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcedureKind {
    /// One-shot read.
    Query,
    /// One-shot write.
    Mutation,
    /// Long-lived stream of values.
    Subscription,
}

impl ProcedureKind {
    /// Wire-format method name for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a dispatch produced: a single value or a stream of them.
///
/// Queries and mutations must yield [`DispatchReply::Value`]; subscriptions
/// must yield [`DispatchReply::Stream`]. The transports enforce the latter
/// and treat a mismatch as an internal error.
pub enum DispatchReply {
    /// Single result value.
    Value(Value),
    /// Stream of result values, terminated by completion or an error item.
    Stream(ValueStream),
}

impl std::fmt::Debug for DispatchReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Black-box procedure dispatch engine.
///
/// Resolves `path` + `input` to a result, a stream, or a typed error.
/// Routing, input validation, and execution are entirely the engine's
/// concern; the transports only shuttle envelopes in and out.
#[async_trait]
pub trait Dispatcher<Ctx>: Send + Sync {
    /// Execute the procedure at `path` with the given input and context.
    async fn dispatch(
        &self,
        path: &str,
        input: Option<Value>,
        ctx: &Ctx,
        kind: ProcedureKind,
    ) -> Result<DispatchReply, RelayError>;
}
