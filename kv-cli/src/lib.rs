//! `kvcli`: an administrative command-line client for `kv::Engine`.
//!
//! ```doc
//! ❯ kvcli put order_key xxx
//! OK
//!
//! ❯ kvcli get order_key
//! xxx
//!
//! ❯ kvcli delete order_key
//! OK
//!
//! ❯ kvcli get order_key
//! error: key not found: order_key
//! ```

pub mod command;
pub mod config;
pub mod trace;
