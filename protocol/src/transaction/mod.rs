//! # Transaction Module
//!
//! Everything between "the user clicked Buy" and "the ledger says round
//! 100". The core never holds a user's private key, so every ledger
//! operation is split in two: we prepare, somebody else signs, we submit
//! and confirm.
//!
//! ## Architecture
//!
//! ```text
//! types.rs        - kinds, bodies, phases, integer codecs
//! builder.rs      - TransactionBuilder, group assignment, descriptors
//! signing.rs      - TransactionSigner seam, submission framing
//! verification.rs - structural, signature and group checks
//! protocol.rs     - prepare / submit / confirm with a bounded poll loop
//! logs.rs         - typed values out of application logs
//! error.rs        - ProtocolError and its retry taxonomy
//! ```
//!
//! ## Design Decisions
//!
//! - Transaction ids are `double_sha256` of the canonical bytes, so an id is
//!   known before the transaction ever leaves the process.
//! - Grouped transactions carry a group id over their member ids; the
//!   ledger applies all of them or none.
//! - All amounts are `u64` in the smallest denomination.

pub mod builder;
pub mod error;
pub mod logs;
pub mod protocol;
pub mod signing;
pub mod types;
pub mod verification;

pub use builder::{
    assign_group, compute_group_id, TransactionBuilder, UnsignedTransaction, UnsignedTransactionDescriptor,
};
pub use error::ProtocolError;
pub use logs::{extract_field, extract_string, extract_u64};
pub use protocol::{
    validate_name, ConfirmationFailure, ConfirmationResult, ConfirmationTracker, Confirmed, NameAction,
    PrepareRequest, TransactionProtocol,
};
pub use signing::{
    decode_frames, encode_frames, sign_transaction, FrameError, KeypairSigner, SignedSubmission, SignedTransaction,
    SignerError, TransactionSigner,
};
pub use types::{btoi, itob, TransactionBody, TransactionKind, TransactionPhase};
pub use verification::{verify_group, verify_signed, verify_structure, TransactionError};
