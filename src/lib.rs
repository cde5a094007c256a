#![deny(warnings, clippy::all, clippy::pedantic)]
#![allow(
    // Acceptable for trait naming consistency (e.g., AutoPublishStore, PgStore)
    clippy::module_name_repetitions,

    // Required for signed/unsigned conversions in database rows and pagination
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,

    // Gauge values: usize -> f64 conversions for heap depth and pool occupancy
    clippy::cast_precision_loss,

    // Domain logic often requires helper declarations mid-function for readability
    clippy::items_after_statements,

    // Error context via typed CoreError already provides sufficient documentation
    clippy::missing_errors_doc,

    // Panic paths are defensive (e.g., mutex poisoning), not part of normal flow
    clippy::missing_panics_doc,

    // Technical identifiers (e.g., DSN, OTLP, CAS) don't need markdown formatting
    clippy::doc_markdown,

    // Named format args reduce readability for long messages with many placeholders
    clippy::uninlined_format_args,

    // if-let-else patterns are clearer than map_or for error handling flows
    clippy::option_if_let_else,

    // Pass-by-value necessary for async trait methods (Arc, Config types)
    clippy::needless_pass_by_value,

    // Too noisy: many utility methods return useful values but aren't always used
    clippy::must_use_candidate,

    // Nested conditions improve readability when branches are semantically distinct
    clippy::collapsible_if,

    // Explicit closures improve clarity for complex async chains
    clippy::redundant_closure,

    // or_else() allocation overhead negligible; or() preferred for readability
    clippy::or_fun_call,

    // for x in iter.iter() is clearer than for x in &iter for consistency
    clippy::explicit_iter_loop,

    // Status match arms are kept parallel even when bodies coincide
    clippy::match_same_arms,

    // Long match arms over entity kinds are clearer unsplit
    clippy::too_many_lines
)]

pub(crate) mod api;
pub mod app;
pub mod clients;
pub mod config;
pub mod executor;
pub mod observability;
pub mod publisher;
pub mod registry;
pub mod ring;
pub mod store;
pub mod strategy;
pub mod trigger;
pub mod util;
