use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::{
    connector::lock,
    error::FileTransferError,
    memory_block::MemoryBlock,
    request::{Callback, CommandOutcome, FileEntry},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryResponse {
    pub successful: bool,
    pub data: Option<MemoryBlock>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileListResponse {
    pub successful: bool,
    pub files: Vec<FileEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandResponse {
    pub successful: bool,
    pub error: Option<FileTransferError>,
}

impl From<CommandOutcome> for CommandResponse {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            successful: outcome.is_ok(),
            error: outcome.err(),
        }
    }
}

/// Wraps the caller's callback so that its first invocation also completes
/// the returned receiver. Once every copy of the wrapper is dropped without
/// being called, the receiver reports an error instead of hanging.
pub(super) fn completion<T>(callback: Option<Callback<T>>) -> (Callback<T>, oneshot::Receiver<T>)
where
    T: Clone + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let sender = Mutex::new(Some(sender));
    let wrapper = Callback::new(move |value: T| {
        if let Some(callback) = &callback {
            callback.call(value.clone());
        }
        if let Some(sender) = lock(&sender).take() {
            let _ = sender.send(value);
        }
    });
    (wrapper, receiver)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn completion_calls_through_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (wrapper, receiver) = completion(Some(Callback::new(move |value: u8| {
            counter.fetch_add(value as usize, Ordering::SeqCst);
        })));
        wrapper.call(2);
        wrapper.call(3);
        assert_eq!(receiver.await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn dropped_wrappers_fail_the_receiver() {
        let (wrapper, receiver) = completion::<u8>(None);
        drop(wrapper.clone());
        drop(wrapper);
        assert!(receiver.await.is_err());
    }

    #[test]
    fn outcomes_convert() {
        assert_eq!(
            CommandResponse::from(Err(FileTransferError::Disconnected)),
            CommandResponse {
                successful: false,
                error: Some(FileTransferError::Disconnected),
            }
        );
        assert!(CommandResponse::from(Ok(())).successful);
    }
}
