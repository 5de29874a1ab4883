//! sdmmc-storage - HTTP file server
//!
//! Serves a directory of the card under a URL prefix. `GET` lists folders
//! and downloads files, `POST` uploads and `DELETE` removes. Downloads,
//! uploads and deletion are each switched on separately and are all off
//! unless configured.
//!
//! The web server itself lives elsewhere: it hands a [`Request`] to
//! [`FileServer::handle`] and sends back the [`Response`]. File downloads
//! come back as a [`Download`] which the web server drains in
//! [`CHUNK_SIZE`] pieces, so a large file never has to fit in memory. The
//! download holds on to the storage it was served from until it is dropped.
//! Hand the server `&mut *cell.borrow_mut()` of a shared card and everyone
//! else going through the `RefCell` gets [`StorageError::Busy`] meanwhile.

mod listing;

use alloc::borrow::ToOwned;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

#[cfg(feature = "log")]
use log::{debug, info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, info, warn};

use crate::config::{ConfigError, FileServerConfig};
use crate::path;
use crate::storage::{Storage, StorageError};

use listing::{Entry, Listing};

/// Bytes read from the card per download step.
pub const CHUNK_SIZE: usize = 1024;

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
        }
    }

    pub fn from_name(name: &str) -> Option<Method> {
        let method = match name {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            _ => return None,
        };
        Some(method)
    }
}

/// An HTTP request as handed over by the web server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Path plus optional query string, still percent-encoded
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Request {
        Request {
            method,
            url: url.to_owned(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn get(url: &str) -> Request {
        Request::new(Method::Get, url)
    }

    pub fn post(url: &str, body: &[u8]) -> Request {
        Request::new(Method::Post, url).with_body(body)
    }

    pub fn delete(url: &str) -> Request {
        Request::new(Method::Delete, url)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Request {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Request {
        self.body = body.to_vec();
        self
    }

    /// Header lookup, ignoring case of the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The URL without query string or fragment.
    pub fn path(&self) -> &str {
        let end = self.url.find(|c| c == '?' || c == '#').unwrap_or(self.url.len());
        &self.url[..end]
    }

    /// A raw (still encoded) query parameter.
    pub fn query(&self, name: &str) -> Option<&str> {
        let start = self.url.find('?')? + 1;
        let query = &self.url[start..];
        let query = &query[..query.find('#').unwrap_or(query.len())];
        query.split('&').find_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(key), value) if key == name => Some(value.unwrap_or("")),
                _ => None,
            }
        })
    }

    fn accepts_json(&self) -> bool {
        self.header("Accept")
            .map(|accept| accept.contains("application/json"))
            .unwrap_or(false)
    }
}

/// A file being sent to the client. It keeps the storage borrowed until it
/// is dropped, so nobody can change the file halfway through.
pub struct Download<'s, S: ?Sized> {
    storage: &'s mut S,
    path: String,
    size: u64,
    offset: u64,
}

impl<'s, S> Download<'s, S>
where
    S: Storage + ?Sized,
{
    /// Path of the file on the card.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.offset
    }

    /// Read the next piece of the file into `buffer`, at most
    /// [`CHUNK_SIZE`] bytes. Zero means the download is complete.
    pub fn next_chunk(&mut self, buffer: &mut [u8]) -> Result<usize, StorageError> {
        let len = buffer.len().min(CHUNK_SIZE);
        let len = if (len as u64) > self.remaining() {
            self.remaining() as usize
        } else {
            len
        };
        if len == 0 {
            return Ok(0);
        }
        let read = self.storage.read_at(&self.path, self.offset, &mut buffer[..len])?;
        if read == 0 {
            // The file is shorter than when the response started
            self.size = self.offset;
        }
        self.offset += read as u64;
        Ok(read)
    }

    /// Drain the rest of the download into memory.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, StorageError> {
        let mut contents = Vec::with_capacity(self.remaining() as usize);
        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            let read = self.next_chunk(&mut buffer)?;
            if read == 0 {
                return Ok(contents);
            }
            contents.extend_from_slice(&buffer[..read]);
        }
    }
}

impl<'s, S: ?Sized> fmt::Debug for Download<'s, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("offset", &self.offset)
            .finish()
    }
}

#[derive(Debug)]
pub enum Body<'s, S: ?Sized> {
    Text(String),
    Download(Download<'s, S>),
}

#[derive(Debug)]
pub struct Response<'s, S: ?Sized> {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Body<'s, S>,
}

impl<'s, S: ?Sized> Response<'s, S> {
    fn new(status: u16, content_type: &'static str, body: Body<'s, S>) -> Self {
        Response {
            status,
            content_type,
            headers: Vec::new(),
            body,
        }
    }

    fn text(status: u16, text: &str) -> Self {
        Response::new(status, "text/plain", Body::Text(text.to_owned()))
    }

    fn forbidden() -> Self {
        Response::text(403, "Forbidden")
    }

    fn bad_request(text: &str) -> Self {
        Response::text(400, text)
    }

    fn with_header(mut self, name: &str, value: String) -> Self {
        self.headers.push((name.to_owned(), value));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The body, unless it is a download.
    pub fn body_text(&self) -> Option<&str> {
        match &self.body {
            Body::Text(text) => Some(text),
            Body::Download(_) => None,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            409 => "Conflict",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            507 => "Insufficient Storage",
            _ => "",
        }
    }
}

/// HTTP status for a failed storage operation.
pub fn status_for(error: StorageError) -> u16 {
    match error {
        StorageError::NotFound => 404,
        StorageError::AlreadyExists
        | StorageError::NotEmpty
        | StorageError::NotADirectory
        | StorageError::IsADirectory => 409,
        StorageError::InvalidName => 400,
        StorageError::PathEscape => 403,
        StorageError::NoSpace => 507,
        StorageError::Unavailable | StorageError::Busy => 503,
        StorageError::Io => 500,
    }
}

impl<'s, S: ?Sized> From<StorageError> for Response<'s, S> {
    fn from(error: StorageError) -> Self {
        Response::text(status_for(error), &format!("{}", error))
    }
}

/// Where a request points.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    /// As seen under the server's root
    relative: String,
    /// On the card
    absolute: String,
}

/// Offset and position of one upload chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    offset: u64,
    last: bool,
}

impl Chunk {
    /// Chunked uploads carry the byte offset of the chunk as `index` and
    /// flag the final one with `last`. Without `index` the body is the
    /// whole file.
    fn from_request<'s, S: ?Sized>(request: &Request) -> Result<Chunk, Response<'s, S>> {
        let index = match request.query("index") {
            None => {
                return Ok(Chunk {
                    offset: 0,
                    last: true,
                })
            }
            Some(index) => index,
        };
        let offset = index
            .parse::<u64>()
            .map_err(|_| Response::bad_request("Invalid chunk index"))?;
        let last = match request.query("last") {
            None | Some("false") | Some("0") => false,
            Some("") | Some("true") | Some("1") => true,
            Some(_) => return Err(Response::bad_request("Invalid last flag")),
        };
        Ok(Chunk { offset, last })
    }
}

fn valid_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(|c| c == '/' || c == '\\')
}

/// The request handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileServer {
    config: FileServerConfig,
}

impl FileServer {
    pub fn new(config: FileServerConfig) -> Result<FileServer, ConfigError> {
        Ok(FileServer {
            config: config.validate()?,
        })
    }

    pub fn config(&self) -> &FileServerConfig {
        &self.config
    }

    /// Whether `url` is under this server's prefix.
    pub fn can_handle(&self, url: &str) -> bool {
        let end = url.find(|c| c == '?' || c == '#').unwrap_or(url.len());
        self.strip_prefix(&url[..end]).is_some()
    }

    pub fn dump_config(&self) {
        info!("SD File Server:");
        info!("  Url Prefix: /{}", self.config.url_prefix.as_str());
        info!("  Root Path: {}", self.config.root_path.as_str());
        info!("  Deletion Enabled: {}", self.config.enable_deletion);
        info!("  Download Enabled: {}", self.config.enable_download);
        info!("  Upload Enabled: {}", self.config.enable_upload);
    }

    /// Answer one request. A download keeps `storage` borrowed until it is
    /// dropped.
    pub fn handle<'s, S>(&self, storage: &'s mut S, request: &Request) -> Response<'s, S>
    where
        S: Storage + ?Sized,
    {
        debug!("{} {}", request.method.name(), request.url.as_str());
        let target = match self.resolve(request.path()) {
            Ok(target) => target,
            Err(response) => return response,
        };
        let response = match request.method {
            Method::Get => self.handle_get(storage, request, &target),
            Method::Post => self.handle_upload(storage, request, &target),
            Method::Delete => self.handle_delete(storage, &target),
            _ => Response::text(405, "Method not allowed")
                .with_header("Allow", String::from("GET, POST, DELETE")),
        };
        if response.status != 200 {
            debug!("{} {} -> {}", request.method.name(), request.url.as_str(), response.status);
        }
        response
    }

    /// Whatever follows `/{prefix}`, if the path is under it.
    fn strip_prefix<'a>(&self, url_path: &'a str) -> Option<&'a str> {
        let rest = url_path
            .strip_prefix(path::SEPARATOR)?
            .strip_prefix(self.config.url_prefix.as_str())?;
        if rest.is_empty() || path::is_absolute(rest) {
            Some(rest)
        } else {
            None
        }
    }

    fn resolve<'s, S: ?Sized>(&self, url_path: &str) -> Result<Target, Response<'s, S>> {
        let rest = self
            .strip_prefix(url_path)
            .ok_or_else(|| Response::text(404, "Not found"))?;
        let decoded = path::percent_decode(rest).ok_or_else(|| Response::bad_request("Malformed URL"))?;
        let relative = path::normalize(&decoded).map_err(|_| {
            warn!("Refusing path outside of the root");
            Response::forbidden()
        })?;
        let absolute = path::normalize(&path::join(&self.config.root_path, &relative))
            .map_err(|_| Response::forbidden())?;
        Ok(Target { relative, absolute })
    }

    fn url_for(&self, relative: &str) -> String {
        let mut url = format!("/{}", self.config.url_prefix);
        if relative != "/" {
            url.push_str(&path::percent_encode(relative));
        }
        url
    }

    fn handle_get<'s, S>(&self, storage: &'s mut S, request: &Request, target: &Target) -> Response<'s, S>
    where
        S: Storage + ?Sized,
    {
        let info = match storage.stat(&target.absolute) {
            Ok(info) => info,
            Err(e) => return e.into(),
        };
        if info.is_directory {
            return self.handle_index(storage, request, target);
        }
        if !self.config.enable_download {
            return Response::forbidden();
        }
        let name = path::file_name(&target.absolute).replace('"', "'");
        Response::new(
            200,
            path::mime_type(&target.absolute),
            Body::Download(Download {
                storage,
                path: target.absolute.clone(),
                size: info.size,
                offset: 0,
            }),
        )
        .with_header("Content-Disposition", format!("attachment; filename=\"{}\"", name))
        .with_header("Content-Length", format!("{}", info.size))
    }

    fn handle_index<'s, S>(&self, storage: &mut S, request: &Request, target: &Target) -> Response<'s, S>
    where
        S: Storage + ?Sized,
    {
        let children = match storage.list_directory(&target.absolute, 0) {
            Ok(children) => children,
            Err(e) => return e.into(),
        };
        let entries = children
            .into_iter()
            .map(|child| {
                let relative = path::remove_root_path(&child.path, &self.config.root_path);
                Entry::new(
                    path::file_name(&child.path).to_owned(),
                    self.url_for(&relative),
                    child.is_directory,
                    child.size,
                )
            })
            .collect();
        let parent_url = if target.relative == "/" {
            None
        } else {
            let parent = path::normalize(&path::join(&target.relative, "..")).unwrap_or_else(|_| String::from("/"));
            Some(self.url_for(&parent))
        };
        let mut listing = Listing {
            folder: target.relative.clone(),
            parent_url,
            entries,
            download: self.config.enable_download,
            upload: self.config.enable_upload,
            deletion: self.config.enable_deletion,
        };
        listing.sort();
        if request.accepts_json() {
            match listing.json() {
                Some(json) => Response::new(200, "application/json", Body::Text(json)),
                None => {
                    warn!("Listing of {} is too large", target.relative.as_str());
                    Response::text(500, "Listing too large")
                }
            }
        } else {
            Response::new(200, "text/html", Body::Text(listing.html()))
        }
    }

    fn handle_upload<'s, S>(&self, storage: &mut S, request: &Request, target: &Target) -> Response<'s, S>
    where
        S: Storage + ?Sized,
    {
        if !self.config.enable_upload {
            return Response::forbidden();
        }
        let chunk = match Chunk::from_request(request) {
            Ok(chunk) => chunk,
            Err(response) => return response,
        };
        let file = match self.upload_file(storage, request, target) {
            Ok(file) => file,
            Err(response) => return response,
        };
        if let Err(response) = Self::store_chunk(storage, &file, chunk, &request.body) {
            // Don't leave half a file behind
            match storage.delete_file(&file) {
                Ok(()) | Err(StorageError::NotFound) => {}
                Err(e) => warn!("Failed to remove partial upload {}: {}", file.as_str(), e),
            }
            return response;
        }
        if chunk.last {
            debug!("Upload of {} complete", file.as_str());
            Response::text(200, "File uploaded")
        } else {
            Response::text(200, "Chunk stored")
        }
    }

    /// Path of the uploaded file. Posting to a folder names the file with
    /// the `name` parameter.
    fn upload_file<'s, S>(
        &self,
        storage: &mut S,
        request: &Request,
        target: &Target,
    ) -> Result<String, Response<'s, S>>
    where
        S: Storage + ?Sized,
    {
        let is_directory = match storage.stat(&target.absolute) {
            Ok(info) => info.is_directory,
            Err(StorageError::NotFound) => false,
            Err(e) => return Err(e.into()),
        };
        if !is_directory {
            return Ok(target.absolute.clone());
        }
        let name = request
            .query("name")
            .ok_or_else(|| Response::bad_request("A file name is required"))?;
        let name = path::percent_decode(name).ok_or_else(|| Response::bad_request("Malformed URL"))?;
        if !valid_file_name(&name) {
            return Err(Response::bad_request("Invalid file name"));
        }
        Ok(path::join(&target.absolute, &name))
    }

    fn store_chunk<'s, S>(storage: &mut S, file: &str, chunk: Chunk, data: &[u8]) -> Result<(), Response<'s, S>>
    where
        S: Storage + ?Sized,
    {
        if chunk.offset == 0 {
            return storage.write_file(file, data).map_err(Response::from);
        }
        match storage.file_size(file) {
            Ok(size) if size == chunk.offset => storage.append_file(file, data).map_err(Response::from),
            Ok(_) | Err(StorageError::NotFound) => Err(Response::bad_request("Chunk out of order")),
            Err(e) => Err(e.into()),
        }
    }

    fn handle_delete<'s, S>(&self, storage: &mut S, target: &Target) -> Response<'s, S>
    where
        S: Storage + ?Sized,
    {
        if !self.config.enable_deletion || target.relative == "/" {
            return Response::forbidden();
        }
        let result = match storage.stat(&target.absolute) {
            Ok(info) if info.is_directory => storage.remove_directory(&target.absolute),
            Ok(_) => storage.delete_file(&target.absolute),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Response::text(200, "Deleted"),
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod test;

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
