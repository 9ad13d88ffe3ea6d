use futures::{
    channel::oneshot,
    future::{FusedFuture, FutureExt, Shared},
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

// One-shot broadcast flag, used to request exit from long-lived tasks.
// Dropping the Sender without signaling behaves as a signal, so an abandoned
// parent always releases its children.
#[derive(Debug)]
pub struct Sender {
    sender: oneshot::Sender<()>,
    receiver: Receiver,
}
impl Sender {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel::<()>();

        let receiver = receiver.shared();
        let receiver = Receiver { inner: receiver };

        Self { sender, receiver }
    }

    pub fn receiver(&self) -> Receiver {
        self.receiver.clone()
    }

    pub fn signal(self) {
        let _ = self.sender.send(());
    }
}

#[derive(Clone)]
pub struct Receiver {
    inner: Shared<oneshot::Receiver<()>>,
}
impl std::fmt::Debug for Receiver {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}
impl Future for Receiver {
    type Output = ();

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}
impl FusedFuture for Receiver {
    fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }
}

pub fn pair() -> (Sender, Receiver) {
    let sender = Sender::new();
    let receiver = sender.receiver();
    (sender, receiver)
}
