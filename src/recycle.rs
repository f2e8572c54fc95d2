use std::sync::mpsc::{self, Receiver, Sender};

#[derive(Debug)]
pub(crate) struct ReturnQueueTx<T> {
    inner: Sender<T>,
}

impl<T> Clone for ReturnQueueTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ReturnQueueRx<T> {
    inner: Receiver<T>,
}

pub(crate) fn return_queue<T>() -> (ReturnQueueTx<T>, ReturnQueueRx<T>) {
    let (tx, rx) = mpsc::channel();
    (ReturnQueueTx { inner: tx }, ReturnQueueRx { inner: rx })
}

impl<T> ReturnQueueTx<T> {
    /// Hands `value` back to the owner; gives it back if the owner is gone.
    pub(crate) fn send(&self, value: T) -> Result<(), T> {
        self.inner.send(value).map_err(|err| err.0)
    }
}

impl<T> ReturnQueueRx<T> {
    pub(crate) fn drain(&self) -> Vec<T> {
        self.inner.try_iter().collect()
    }
}
