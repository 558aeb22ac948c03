//! # form-runtime: Declarative Form Rule Engine
//!
//! A form is described by a JSON schema document whose fields carry
//! *predicates*: a condition plus an action such as CALC, OPTION_FILTER or
//! APPLY_ACCESS_MATRIX. This crate loads such documents, orders their
//! dependencies and keeps a session's answers, access state and options
//! consistent as edits arrive.
//!
//! ## Processing Pipeline
//!
//! ```text
//! Schema JSON → Loader → Dependency Graph → Session → Propagation → Snapshot
//!                 │                            │
//!          Tokenizer → Parser          Executor → Evaluator
//!                                          │
//!                                   Master Data Manager
//! ```
//!
//! ### Stage 1: Schema Loading
//!
//! The [`schema`] module flattens the document into fields addressed by
//! [`schema::FieldId`], compiling every condition and formula up front with
//! the [`tokenizer`] and [`analyzer`] modules. Malformed rules reject the whole
//! document.
//!
//! ### Stage 2: Dependency Analysis
//!
//! The [`graph`] module turns `dependentKeys` into trigger edges, rejects
//! cycles and warns about expressions that read undeclared fields.
//!
//! ### Stage 3: Sessions and Propagation
//!
//! A [`session::FormSession`] applies one edit at a time and runs the
//! predicates it triggers breadth-first until nothing changes. The
//! [`action`] executor evaluates expressions ([`eval`]) and produces effects;
//! the session applies them to the [`answer`] store and the [`access`]
//! matrix.
//!
//! ### Stage 4: Master Data
//!
//! OPTION_FILTER and master-bound fields read reference datasets through the
//! [`master`] module, which caches, deduplicates and refreshes them.

pub mod access;
pub mod action;
pub mod analyzer;
pub mod answer;
pub mod ast;
pub mod config;
pub mod error;
pub mod eval;
pub mod graph;
pub mod master;
pub mod schema;
pub mod session;
pub mod tokenizer;

// Re-exports
pub use analyzer::parse_rule;
pub use answer::AnswerStore;
pub use config::RuntimeConfig;
pub use error::*;
pub use graph::DependencyGraph;
pub use schema::Schema;
pub use session::{FormDefinition, FormSession, PropagationReport, Services, SessionHandle};
