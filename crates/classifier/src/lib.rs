//! Ultra Classifier
//!
//! Converts the backend's free-form text output into `ClassifiedEvent`s.
//! `rules` holds the pure, ordered message rules; `stream` segments an
//! arbitrarily chunked stdout stream into messages and feeds them through
//! those rules.

pub mod rules;
pub mod stream;

pub use rules::{
    classify, classify_stderr, error_message_for, icon_for_action, GENERIC_ERROR_MESSAGE,
    RATE_LIMIT_MARKER, RATE_LIMIT_MESSAGE,
};
pub use stream::{Classifier, Events};
