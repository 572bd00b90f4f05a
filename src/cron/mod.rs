//! Cron expression parsing and next-fire computation.
//!
//! Expressions are evaluated in UTC and accept three shapes:
//!
//! | Fields | Layout                                   |
//! |--------|------------------------------------------|
//! | 5      | `min hour dom month dow`                 |
//! | 6      | `sec min hour dom month dow`             |
//! | 7      | `sec min hour dom month dow year`        |
//!
//! The `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight`
//! and `@hourly` macros are also recognised.

mod expr;

pub use expr::{CronExpr, CronField, CronParseError};
