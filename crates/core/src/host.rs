//! Services the host provides to the engine.

use std::sync::Arc;

use refscope_ingest::IntakeHandle;

use crate::model::{FileEvent, FileId};

/// The host's view of which files exist.
pub trait FileTree: Send + Sync {
    /// Every file currently in scope.
    fn file_ids(&self) -> Vec<FileId>;

    /// False once a file was deleted or left the project scope.
    fn is_live(&self, file: FileId) -> bool;
}

impl<T: FileTree + ?Sized> FileTree for Arc<T> {
    fn file_ids(&self) -> Vec<FileId> {
        (**self).file_ids()
    }

    fn is_live(&self, file: FileId) -> bool {
        (**self).is_live(file)
    }
}

/// Process-wide pause source polled by the scheduler.
pub trait PauseSignal: Send + Sync {
    fn is_paused(&self) -> bool;
}

/// Producer of file change notifications.
///
/// The source keeps the handle and pushes events into it; the engine never
/// calls back into host code.
pub trait FileChangeSource {
    fn attach(&mut self, intake: IntakeHandle<FileEvent>);
}
