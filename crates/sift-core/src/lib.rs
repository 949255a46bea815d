//! Sift Core - filter rule parsing and matching.
//!
//! This crate parses AdBlock-style and hosts-file filter lists into token
//! tries and evaluates them against HTTP requests and responses. It has no
//! I/O of its own; the proxy crate feeds it `http` request and response heads.
//!
//! # Example
//!
//! ```
//! use sift_core::Filter;
//!
//! let filter = Filter::new();
//! filter.add_rules("||ads.example.com^\n".as_bytes(), "Example list");
//!
//! let (mut parts, ()) = http::Request::get("https://ads.example.com/banner.js")
//!     .body(())
//!     .unwrap()
//!     .into_parts();
//! let response = filter.handle_request(&mut parts).unwrap();
//! assert_eq!(response.status(), http::StatusCode::FORBIDDEN);
//! ```

pub mod error;
pub mod exception;
pub mod filter;
pub mod modifiers;
pub mod network_rules;
pub mod rule;
pub mod tokenize;
pub mod trie;

pub use error::{Result, RuleError};
pub use exception::ExceptionRule;
pub use filter::{EventCallback, Filter, FilterAction, FilterEvent, RuleCounts, USER_RULES_LIST};
pub use network_rules::{NetworkRules, RequestVerdict, RuleKind};
pub use rule::{AppliedRule, Rule};
pub use tokenize::{is_separator_token, tokenize};
pub use trie::{RuleTrie, TrieData};
