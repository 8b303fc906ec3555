//! Correlation id management.
//!
//! Every frame carries `(function_id, global_id)`. The global id is a single
//! per-connection sequence advanced by every frame sent *or* consumed, so
//! both peers hold the same counter and each can predict the id of the next
//! inbound frame. Function ids pair requests with responses through a LIFO
//! stack: a `FunctionCall` pushes a fresh id, a `DataReturn` or `FileMeta`
//! response pops the top.
//!
//! Receivers mirror every update the sender performed, which keeps the two
//! stacks identical across arbitrarily nested bidirectional calls.
//!
//! # Invariants
//!
//! - Assigned global ids are strictly monotonically increasing with no gaps.
//! - Stack depth equals the number of calls in flight; it returns to its
//!   pre-call value after every call/response pair.

use wirecall_proto::{CorrelationIds, PacketKind};

/// Divergence observed between a received frame and the local prediction.
///
/// Mismatches are diagnostics, not failures: the frame is still processed
/// and the connection stays up, but the engine logs them because they mean
/// frames were lost, duplicated, or produced by a buggy peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationMismatch {
    /// The frame's global id is ahead of the prediction: frames were lost.
    GlobalAhead {
        /// Locally predicted next inbound global id.
        expected: i32,
        /// Global id actually received.
        actual: i32,
    },
    /// The frame's global id is behind the prediction: a stale or duplicated
    /// frame.
    GlobalBehind {
        /// Locally predicted next inbound global id.
        expected: i32,
        /// Global id actually received.
        actual: i32,
    },
    /// The frame's function id differs from the mirrored assignment.
    FunctionMismatch {
        /// Function id the mirror predicted.
        expected: i32,
        /// Function id actually received.
        actual: i32,
    },
    /// A response arrived while no call was outstanding.
    UnexpectedResponse,
}

/// Per-connection assignment and validation of correlation ids.
#[derive(Debug, Default)]
pub struct CorrelationManager {
    next_function_id: i32,
    next_global_id: i32,
    stack: Vec<i32>,
}

impl CorrelationManager {
    /// Fresh state: both counters at zero, empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign ids to an outbound packet and update state.
    ///
    /// `FunctionCall` takes a fresh function id and pushes it; responses
    /// (`DataReturn`, `FileMeta`) take the id popped from the top of the
    /// stack. A response assigned with no call outstanding gets function id
    /// `-1`; the caller logs it as a protocol anomaly.
    pub fn assign_outbound(&mut self, kind: PacketKind) -> CorrelationIds {
        let global_id = self.next_global_id;
        self.next_global_id += 1;

        let function_id = match kind {
            PacketKind::FunctionCall => {
                let id = self.next_function_id;
                self.stack.push(id);
                self.next_function_id += 1;
                id
            },
            PacketKind::DataReturn | PacketKind::FileMeta => self.stack.pop().unwrap_or(-1),
        };

        CorrelationIds::new(function_id, global_id)
    }

    /// Mirror the update a received frame's sender performed.
    ///
    /// Returns every divergence between the frame and the local prediction;
    /// an empty list is the normal case.
    pub fn apply_inbound(
        &mut self,
        kind: PacketKind,
        ids: CorrelationIds,
    ) -> Vec<CorrelationMismatch> {
        let mut mismatches = Vec::new();

        if ids.global_id > self.next_global_id {
            mismatches.push(CorrelationMismatch::GlobalAhead {
                expected: self.next_global_id,
                actual: ids.global_id,
            });
        } else if ids.global_id < self.next_global_id {
            mismatches.push(CorrelationMismatch::GlobalBehind {
                expected: self.next_global_id,
                actual: ids.global_id,
            });
        }
        self.next_global_id = ids.global_id + 1;

        match kind {
            PacketKind::FunctionCall => {
                if ids.function_id != self.next_function_id {
                    mismatches.push(CorrelationMismatch::FunctionMismatch {
                        expected: self.next_function_id,
                        actual: ids.function_id,
                    });
                }
                self.stack.push(self.next_function_id);
                self.next_function_id += 1;
            },
            PacketKind::DataReturn | PacketKind::FileMeta => match self.stack.pop() {
                Some(top) => {
                    if top != ids.function_id {
                        mismatches.push(CorrelationMismatch::FunctionMismatch {
                            expected: top,
                            actual: ids.function_id,
                        });
                    }
                },
                None => mismatches.push(CorrelationMismatch::UnexpectedResponse),
            },
        }

        mismatches
    }

    /// Push `n` fresh function ids without sending calls.
    ///
    /// The key-exchange handshake reserves exactly two slots this way on
    /// both sides, so application-level call ids line up afterwards.
    pub fn reserve_slots(&mut self, n: usize) {
        for _ in 0..n {
            self.stack.push(self.next_function_id);
            self.next_function_id += 1;
        }
    }

    /// Global id the next inbound or outbound frame is expected to carry.
    #[must_use]
    pub fn next_global_id(&self) -> i32 {
        self.next_global_id
    }

    /// Function id the next outbound call would take.
    #[must_use]
    pub fn next_function_id(&self) -> i32 {
        self.next_function_id
    }

    /// Function id of the innermost outstanding call, if any.
    #[must_use]
    pub fn top(&self) -> Option<i32> {
        self.stack.last().copied()
    }

    /// Number of calls currently in flight.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}
