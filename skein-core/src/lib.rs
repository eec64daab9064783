//! # skein-core
//!
//! Shared contracts for the Skein workflow engine: the typed state
//! [`Value`], the error taxonomy ([`ErrorKind`], [`Severity`],
//! [`ErrorContext`]) with its classification chain, and the abstract
//! adapter traits for everything the engine consumes from outside:
//! function invocation, REST tools, secrets, identity, checkpoint
//! storage, telemetry, human interaction, and embeddings.
//!
//! The engine itself lives in `skein-graph`; this crate is the
//! vocabulary both it and adapter implementations depend on.

pub mod adapters;
pub mod error;
pub mod value;

pub use adapters::{
    CheckpointStore, EmbeddingProvider, FunctionInvoker, HumanChannel, HumanResponse,
    IdentityValidator, Principal, SecretResolver, TelemetrySink, ToolAdapter, ToolRequest,
    ToolSchema, ValueMap,
};
pub use error::{
    ClassificationRule, CoreError, ErrorClassifier, ErrorContext, ErrorKind, Result, Severity,
};
pub use value::{Value, ValueKind};
