// Copyright (c) 2026 DeSciChain Contributors. MIT License.
// See LICENSE for details.

//! # DeSci Marketplace: Core Library
//!
//! A marketplace where researchers sell trained models without handing
//! them to a middleman in the clear. The money sits in an on-chain escrow;
//! the model sits in a blob store, sealed; the key only moves once the
//! escrow has settled. Nobody has to trust anybody, which is the whole
//! point of doing science on a ledger and not over email.
//!
//! ## Architecture
//!
//! - **crypto**: Envelope codec, KDFs, hybrid key wrap, composable layers.
//! - **watermark**: Ownership marks, contiguous and steganographic.
//! - **transaction**: Prepare, let the wallet sign, submit, poll. Repeat
//!   until confirmed or until the deadline says stop.
//! - **escrow**: The one piece of shared mutable state. Guarded per id.
//! - **market**: Publish and purchase flows on top of everything else.
//! - **ledger**: The gateway trait. The ledger itself lives elsewhere.
//! - **storage**: Blob, record and escrow stores: in-memory and sled.
//! - **config**: Constants, KDF parameters and typed config structs.
//!
//! ## Design Philosophy
//!
//! 1. The core never sees a private key. It prepares, the wallet signs.
//! 2. Nothing is `completed` without a confirmed round to point at.
//! 3. Keys leave the process once, and only their hash is ever stored.
//! 4. If it moves money, it has tests. Plural.

pub mod config;
pub mod crypto;
pub mod escrow;
pub mod ledger;
pub mod market;
pub mod storage;
pub mod transaction;
pub mod watermark;
