//! Remote mailbox access.
//!
//! The apply and purge paths talk to a [`MailboxApi`]; [`GmailMailbox`] is the
//! production implementation over the Gmail REST API.

mod gmail;
mod traits;

pub use gmail::{GmailCredentials, GmailMailbox, GMAIL_API_BASE, GOOGLE_TOKEN_URL};
pub use traits::{MailboxApi, MailboxError, Result};
