// src/core/cancellation.rs

//! Composes cancellation tokens. A linked token is a child of one token that is also
//! cancelled when a second, unrelated token fires.

use tokio_util::sync::{CancellationToken, DropGuard};

/// A token cancelled when either of its sources is cancelled, or when dropped.
///
/// Dropping the handle cancels the composed token, which also ends the task that
/// forwards the second source, so nothing outlives the operation it guards.
#[derive(Debug)]
pub struct LinkedToken {
    token: CancellationToken,
    _guard: DropGuard,
}

impl LinkedToken {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Links `parent` and `other` into one token.
pub fn link(parent: &CancellationToken, other: &CancellationToken) -> LinkedToken {
    let token = parent.child_token();
    if other.is_cancelled() {
        token.cancel();
    } else {
        let linked = token.clone();
        let other = other.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = other.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
    }
    LinkedToken {
        _guard: token.clone().drop_guard(),
        token,
    }
}
