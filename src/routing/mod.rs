//! Request routing
//!
//! ## Router contract (router.rs)
//!
//! [`Router`] turns a query and its context into a [`RoutingDecision`].
//!
//! ## Heuristic routing (heuristic.rs)
//!
//! Keyword rules with context overrides. Always produces a decision.
//!
//! ## Classifier routing (classifier.rs)
//!
//! Delegates to a pluggable intent classifier and degrades to the heuristic
//! router whenever the classifier cannot give a confident answer.

pub mod classifier;
pub mod heuristic;
pub mod router;

pub use classifier::{Classification, ClassifierError, ClassifierRouter, IntentClassifier};
pub use heuristic::{default_rules, HeuristicRouter, RoutingRule};
pub use router::{Router, RoutingContext, RoutingDecision};
