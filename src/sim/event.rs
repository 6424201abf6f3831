//! Disjunction and conjunction over suspension futures and processes.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::sim::{Ctx, ProcessHandle};

/// The branch of an [`any_of2`] race that completed.
pub enum Either<L, R> {
    Left(L),
    Right(R),
}

/// Races two futures, resolving with whichever completes first. The loser
/// is dropped once this future resolves — suspension futures deregister
/// themselves from their resource on `Drop`, so an abandoned wait leaves no
/// dangling waiter behind.
pub struct AnyOf2<A, B> {
    a: A,
    b: B,
}

impl<A, B> Future for AnyOf2<A, B>
where
    A: Future + Unpin,
    B: Future + Unpin,
{
    type Output = Either<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(v) = Pin::new(&mut this.a).poll(cx) {
            return Poll::Ready(Either::Left(v));
        }
        if let Poll::Ready(v) = Pin::new(&mut this.b).poll(cx) {
            return Poll::Ready(Either::Right(v));
        }
        Poll::Pending
    }
}

/// Builds an [`AnyOf2`] race between two suspension futures, e.g. a disk
/// arbiter's `get(ideal)` raced against its per-slice deadline.
pub fn any_of2<A, B>(a: A, b: B) -> AnyOf2<A, B>
where
    A: Future + Unpin,
    B: Future + Unpin,
{
    AnyOf2 { a, b }
}

/// Waits for every given process to finish. The processes already run
/// concurrently under the scheduler regardless of how this waits for them,
/// so a plain sequential join suffices: whichever handle is still pending
/// when its turn comes blocks this future until it resolves, and any handle
/// that already finished earlier returns immediately without advancing
/// virtual time. The last handle to actually finish is therefore always the
/// one this future is waiting on when it returns, independent of list order.
pub async fn all_of(ctx: &Ctx, handles: &[ProcessHandle]) {
    for handle in handles {
        handle.join(ctx).await;
    }
}
