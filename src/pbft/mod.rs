//! Subprotocol for ordering and executing client [`Request`](crate::types::request::Request)s.
//!
//! PBFT-rs implements the Practical Byzantine Fault Tolerance protocol of Castro and Liskov. A fixed
//! set of `n = 3f+1` replicas agrees on a total order of requests, so that every correct replica
//! executes the same requests in the same order, even if up to `f` replicas are arbitrarily faulty.
//!
//! ## Normal-case operation
//!
//! In every [view](crate::types::data_types::ViewNumber), one replica is the **primary**, namely
//! replica `view mod n` (see [`roles`]). The other replicas are **backups**. A request is ordered in
//! three phases:
//! 1. **Pre-prepare**: the primary assigns the next [sequence
//!    number](crate::types::data_types::SequenceNumber) to the request and broadcasts a
//!    [`PrePrepare`](messages::PrePrepare).
//! 2. **Prepare**: every backup that accepts the pre-prepare broadcasts a matching
//!    [`Prepare`](messages::Prepare). The pre-prepare counts as the primary's prepare vote. A replica
//!    that holds the pre-prepare and a quorum of `2f+1` matching prepare votes considers the request
//!    **prepared**, and broadcasts a [`Commit`](messages::Commit).
//! 3. **Commit**: a prepared request with `2f+1` matching commit votes is **committed-locally**.
//!    Committed requests are handed to the [`App`](crate::app::App) strictly in sequence order.
//!
//! Votes are counted in the [`CertificateTracker`](certificates::CertificateTracker), which rejects
//! a second vote from the same replica for a different digest (equivocation). Per-sequence progress
//! is kept in the [`MessageLog`](message_log::MessageLog).
//!
//! ## Checkpoints and watermarks
//!
//! Every `checkpoint_interval` executed sequence numbers, each replica broadcasts a
//! [`Checkpoint`](messages::Checkpoint) vote carrying its application state digest. `2f+1` matching
//! votes make a checkpoint **stable**. The sequence number of the last stable checkpoint is the
//! **low watermark**, and the low watermark plus the `watermark_window` is the **high watermark**.
//! Replicas only process messages with sequence numbers inside the window, and discard everything at
//! or below the low watermark. See [`checkpoints`].
//!
//! ## View change
//!
//! A backup that waits too long for an outstanding request to execute suspects the primary and
//! broadcasts a [`ViewChange`](messages::ViewChange) for the next view. The message carries the
//! replica's last stable checkpoint with its proof, and the prepared certificates it holds above it.
//! The primary of the new view collects `2f+1` view-changes, recomputes the pre-prepares for every
//! sequence number that may have committed in an earlier view (filling the gaps with null requests),
//! and broadcasts them in a [`NewView`](messages::NewView). Backups check the signatures of every
//! message in the proof, recompute the same assignments from it, check that none of their own
//! prepared requests was dropped, and enter the new view. See [`view_change`].
//!
//! Main type: [`Pbft`](implementation::Pbft).

pub mod certificates;

pub mod checkpoints;

pub mod implementation;

pub mod message_log;

pub mod messages;

pub mod roles;

pub mod types;

pub mod view_change;
