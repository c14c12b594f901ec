//! NNTP (Network News Transfer Protocol) client implementation.
//!
//! Implements the client side of the reader subset of NNTP:
//! - Connection and greeting ([RFC 3977 §5.1](https://datatracker.ietf.org/doc/html/rfc3977#section-5.1)),
//!   over plain TCP or implicit TLS
//! - Authentication via AUTHINFO USER/PASS ([RFC 4643 §2.3](https://datatracker.ietf.org/doc/html/rfc4643#section-2.3))
//! - LIST, GROUP, ARTICLE, HEAD, BODY and POST ([RFC 3977 §6–§7](https://datatracker.ietf.org/doc/html/rfc3977#section-6))
//! - Multi-line response dot-stuffing in both directions ([RFC 3977 §3.1.1](https://datatracker.ietf.org/doc/html/rfc3977#section-3.1.1))
//! - A raw-command escape hatch with exact or prefix status-code matching
//!
//! Every operation accepts an [`OpContext`] carrying an optional deadline
//! and a cancellation token; cancelling the context unblocks the
//! operation's pending I/O immediately. The protocol is strictly
//! request-then-response, so a [`Client`] serves one command at a time and
//! article bodies must be consumed before the next command is issued.

mod cancel;
mod client;
mod error;
mod model;
mod transport;

pub use crate::cancel::OpContext;
pub use crate::client::{ArticleHandle, Client, build_tls_config};
pub use crate::error::NntpError;
pub use crate::model::{Expect, Group, MalformedLinePolicy, NntpResponse, PostingStatus};
pub use crate::transport::{BodyReader, LineTransport, NntpIo};
