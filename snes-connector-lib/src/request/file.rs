use std::{fmt, sync::Arc};

use derive_new::new;
use getset::{CopyGetters, Getters};

use crate::error::FileTransferError;

use super::Callback;

pub type CommandOutcome = Result<(), FileTransferError>;

#[derive(Clone, Debug, PartialEq, Eq, new, CopyGetters, Getters)]
pub struct FileEntry {
    #[getset(get = "pub")]
    name: String,
    /// Name of the containing folder, empty for entries of the root.
    #[getset(get = "pub")]
    parent_name: String,
    #[getset(get = "pub")]
    full_path: String,
    #[getset(get_copy = "pub")]
    is_folder: bool,
}

impl FileEntry {
    pub(crate) fn in_directory(directory: &str, name: &str, is_folder: bool) -> Self {
        let directory = directory.trim_end_matches('/');
        let parent_name = directory.rsplit('/').next().unwrap_or_default();
        Self::new(
            name.to_owned(),
            parent_name.to_owned(),
            format!("{}/{}", directory, name),
            is_folder,
        )
    }
}

pub struct EntryFilter(Arc<dyn Fn(&FileEntry) -> bool + Send + Sync>);

impl EntryFilter {
    pub fn new(f: impl Fn(&FileEntry) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, entry: &FileEntry) -> bool {
        (self.0)(entry)
    }
}

impl Clone for EntryFilter {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl fmt::Debug for EntryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EntryFilter")
    }
}

#[derive(Clone, Debug, CopyGetters, Getters)]
pub struct FileListRequest {
    #[getset(get = "pub")]
    path: String,
    #[getset(get_copy = "pub")]
    recursive: bool,
    #[getset(get = "pub")]
    filter: Option<EntryFilter>,
    #[getset(get = "pub")]
    callback: Option<Callback<Vec<FileEntry>>>,
}

impl FileListRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            recursive: false,
            filter: None,
            callback: None,
        }
    }

    pub fn include_subdirectories(mut self) -> Self {
        self.recursive = true;
        self
    }

    pub fn with_filter(mut self, f: impl Fn(&FileEntry) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(EntryFilter::new(f));
        self
    }

    pub fn with_callback(mut self, f: impl Fn(Vec<FileEntry>) + Send + Sync + 'static) -> Self {
        self.callback = Some(Callback::new(f));
        self
    }

    pub fn matches(&self, entry: &FileEntry) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter.matches(entry))
    }

    pub(crate) fn set_callback(&mut self, callback: Option<Callback<Vec<FileEntry>>>) {
        self.callback = callback;
    }
}

macro_rules! path_request {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(Clone, Debug, Getters)]
        pub struct $name {
            #[getset(get = "pub")]
            path: String,
            #[getset(get = "pub")]
            callback: Option<Callback<CommandOutcome>>,
        }

        impl $name {
            pub fn new(path: impl Into<String>) -> Self {
                Self {
                    path: path.into(),
                    callback: None,
                }
            }

            pub fn with_callback(
                mut self,
                f: impl Fn(CommandOutcome) + Send + Sync + 'static,
            ) -> Self {
                self.callback = Some(Callback::new(f));
                self
            }

            pub(crate) fn set_callback(&mut self, callback: Option<Callback<CommandOutcome>>) {
                self.callback = callback;
            }
        }
    };
}

path_request!(
    /// Boots the ROM at `path` on the device.
    BootRomRequest
);
path_request!(DeleteFileRequest);
path_request!(CreateDirectoryRequest);
path_request!(DeleteDirectoryRequest);

#[derive(Clone, Debug, Getters)]
pub struct UploadFileRequest {
    #[getset(get = "pub")]
    local_path: String,
    #[getset(get = "pub")]
    target_path: String,
    #[getset(get = "pub")]
    callback: Option<Callback<CommandOutcome>>,
}

impl UploadFileRequest {
    pub fn new(local_path: impl Into<String>, target_path: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            target_path: target_path.into(),
            callback: None,
        }
    }

    pub fn with_callback(mut self, f: impl Fn(CommandOutcome) + Send + Sync + 'static) -> Self {
        self.callback = Some(Callback::new(f));
        self
    }

    pub(crate) fn set_callback(&mut self, callback: Option<Callback<CommandOutcome>>) {
        self.callback = callback;
    }
}
