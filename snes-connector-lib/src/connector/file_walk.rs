use std::{collections::VecDeque, future::Future};

use anyhow::Result;

use crate::request::{FileEntry, FileListRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WalkOrder {
    BreadthFirst,
    DepthFirst,
}

/// Walks the tree under the request's path with an explicit worklist.
/// `list` returns `(name, is_folder)` pairs for one directory. Hidden entries
/// (names starting with '.') are never reported nor descended into.
pub(crate) async fn walk_directory<F, Fut>(
    request: &FileListRequest,
    order: WalkOrder,
    mut list: F,
) -> Result<Vec<FileEntry>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Vec<(String, bool)>>>,
{
    let mut pending = VecDeque::from([request.path().clone()]);
    let mut found = vec![];
    loop {
        let directory = match order {
            WalkOrder::BreadthFirst => pending.pop_front(),
            WalkOrder::DepthFirst => pending.pop_back(),
        };
        let Some(directory) = directory else {
            return Ok(found);
        };
        for (name, is_folder) in list(directory.clone()).await? {
            if name.starts_with('.') {
                continue;
            }
            let entry = FileEntry::in_directory(&directory, &name, is_folder);
            if is_folder && request.recursive() {
                pending.push_back(entry.full_path().clone());
            }
            if request.matches(&entry) {
                found.push(entry);
            }
        }
    }
}
