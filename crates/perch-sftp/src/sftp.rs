//! SFTP protocol adapter
//!
//! Implements the `russh-sftp` server handler on top of [`RequestDispatcher`].
//! Path-based packets become dispatcher requests; handle-based packets
//! (read, write, readdir, fstat) operate on what an earlier open granted.

use crate::dispatcher::{DirListing, Request, RequestDispatcher, Response, WriteMode};
use crate::Error;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use std::collections::HashMap;
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Entries returned per READDIR response
pub const READDIR_PAGE: usize = 100;

/// Largest READ answered in one response
pub const MAX_READ_LEN: u32 = 256 * 1024;

/// File and directory handles one session may hold open at once
pub const MAX_OPEN_HANDLES: usize = 256;

enum OpenHandle {
    File {
        file: tokio::fs::File,
        path: String,
    },
    Dir {
        listing: DirListing,
        offset: usize,
        path: String,
    },
}

/// SFTP handler for one channel
pub struct SftpSession {
    dispatcher: RequestDispatcher,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpSession {
    /// Wrap a dispatcher
    pub fn new(dispatcher: RequestDispatcher) -> Self {
        Self {
            dispatcher,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Dispatcher behind this session
    pub const fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    /// Number of open file and directory handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn ensure_handle_capacity(&self) -> Result<(), StatusCode> {
        if self.handles.len() < MAX_OPEN_HANDLES {
            return Ok(());
        }
        warn!(
            event = "handle_limit_reached",
            session_id = %self.dispatcher.identity().session_id,
            limit = MAX_OPEN_HANDLES,
            "Too many open handles"
        );
        Err(StatusCode::Failure)
    }

    fn insert_handle(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let id = format!("h{}", self.next_handle);
        self.handles.insert(id.clone(), handle);
        id
    }

    async fn dispatch(&self, request: Request) -> Result<Response, StatusCode> {
        let name = request.name();
        self.dispatcher.dispatch(request).await.map_err(|e| {
            debug!(operation = name, error = %e, "Request failed");
            e.to_status_code()
        })
    }

    async fn attributes(&self, request: Request) -> Result<FileAttributes, StatusCode> {
        match self.dispatch(request).await? {
            Response::Attributes(metadata) => Ok(FileAttributes::from(&metadata)),
            _ => Err(StatusCode::Failure),
        }
    }

    async fn done(&self, id: u32, request: Request) -> Result<Status, StatusCode> {
        match self.dispatch(request).await? {
            Response::Done => Ok(ok_status(id)),
            _ => Err(StatusCode::Failure),
        }
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        info!(
            event = "sftp_session_closed",
            session_id = %self.dispatcher.identity().session_id,
            open_handles = self.handles.len(),
            "SFTP session closed"
        );
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn write_mode(pflags: OpenFlags) -> Option<WriteMode> {
    let writes = pflags.intersects(
        OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE | OpenFlags::TRUNCATE,
    );
    writes.then(|| WriteMode {
        read: pflags.contains(OpenFlags::READ),
        create: pflags.contains(OpenFlags::CREATE),
        truncate: pflags.contains(OpenFlags::TRUNCATE),
        append: pflags.contains(OpenFlags::APPEND),
        exclusive: pflags.contains(OpenFlags::EXCLUDE),
    })
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(
            session_id = %self.dispatcher.identity().session_id,
            version,
            "SFTP init"
        );
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        self.ensure_handle_capacity()?;

        let request = match write_mode(pflags) {
            Some(mode) => Request::Write {
                path: filename.clone(),
                mode,
            },
            None => Request::Read {
                path: filename.clone(),
            },
        };

        let Response::File(file) = self.dispatch(request).await? else {
            return Err(StatusCode::Failure);
        };

        let handle = self.insert_handle(OpenHandle::File {
            file,
            path: filename,
        });
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenHandle::File { mut file, path }) => {
                file.flush().await.map_err(|e| Error::Io(e).to_status_code())?;
                debug!(path, "Closed file handle");
                Ok(ok_status(id))
            }
            Some(OpenHandle::Dir { path, .. }) => {
                debug!(path, "Closed directory handle");
                Ok(ok_status(id))
            }
            None => Err(Error::InvalidHandle(handle).to_status_code()),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let Some(OpenHandle::File { file, .. }) = self.handles.get_mut(&handle) else {
            return Err(Error::InvalidHandle(handle).to_status_code());
        };

        let io = |e: std::io::Error| Error::Io(e).to_status_code();
        file.seek(SeekFrom::Start(offset)).await.map_err(io)?;

        let mut data = Vec::new();
        file.take(u64::from(len.min(MAX_READ_LEN)))
            .read_to_end(&mut data)
            .await
            .map_err(io)?;

        if data.is_empty() && len > 0 {
            return Err(StatusCode::Eof);
        }

        self.dispatcher.stats().record_bytes_read(data.len() as u64);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let Some(OpenHandle::File { file, .. }) = self.handles.get_mut(&handle) else {
            return Err(Error::InvalidHandle(handle).to_status_code());
        };

        let io = |e: std::io::Error| Error::Io(e).to_status_code();
        file.seek(SeekFrom::Start(offset)).await.map_err(io)?;
        file.write_all(&data).await.map_err(io)?;
        file.flush().await.map_err(io)?;

        self.dispatcher.stats().record_bytes_written(data.len() as u64);
        Ok(ok_status(id))
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        match self.handles.get(&handle) {
            Some(OpenHandle::File { file, .. }) => {
                let metadata = file
                    .metadata()
                    .await
                    .map_err(|e| Error::Io(e).to_status_code())?;
                Ok(Attrs {
                    id,
                    attrs: FileAttributes::from(&metadata),
                })
            }
            Some(OpenHandle::Dir { path, .. }) => {
                let path = path.clone();
                let attrs = self.attributes(Request::Stat { path }).await?;
                Ok(Attrs { id, attrs })
            }
            None => Err(Error::InvalidHandle(handle).to_status_code()),
        }
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        self.ensure_handle_capacity()?;

        let Response::Listing(listing) = self.dispatch(Request::List { path: path.clone() }).await?
        else {
            return Err(StatusCode::Failure);
        };

        let handle = self.insert_handle(OpenHandle::Dir {
            listing,
            offset: 0,
            path,
        });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let Some(OpenHandle::Dir {
            listing, offset, ..
        }) = self.handles.get_mut(&handle)
        else {
            return Err(Error::InvalidHandle(handle).to_status_code());
        };

        let page = listing.list_at(*offset, READDIR_PAGE);
        if page.entries.is_empty() {
            return Err(StatusCode::Eof);
        }

        *offset += page.entries.len();
        let files = page
            .entries
            .iter()
            .map(|entry| File::new(entry.name.clone(), FileAttributes::from(&entry.metadata)))
            .collect();
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.done(id, Request::Remove { path: filename }).await
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.done(id, Request::Mkdir { path }).await
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.done(id, Request::RemoveDir { path }).await
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        match self.dispatch(Request::Realpath { path }).await? {
            Response::Path(resolved) => Ok(Name {
                id,
                files: vec![File::dummy(resolved)],
            }),
            _ => Err(StatusCode::Failure),
        }
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = self.attributes(Request::Stat { path }).await?;
        Ok(Attrs { id, attrs })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = self.attributes(Request::Lstat { path }).await?;
        Ok(Attrs { id, attrs })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.done(
            id,
            Request::Rename {
                from: oldpath,
                to: newpath,
            },
        )
        .await
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        match self.dispatch(Request::Readlink { path }).await? {
            Response::LinkTarget(target) => Ok(Name {
                id,
                files: vec![File::dummy(target)],
            }),
            _ => Err(StatusCode::Failure),
        }
    }
}
