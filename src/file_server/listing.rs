//! sdmmc-storage - Directory listings
//!
//! Renders the children of one directory for a browser (HTML) or for a
//! script (JSON). Actions only show up when the server allows them.

use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use serde::Serialize;

use crate::path;
use crate::storage::format_size;

/// Largest JSON listing we are willing to render.
const MAX_JSON: usize = 256 * 1024;

/// One child of the listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Entry {
    pub name: String,
    pub url: String,
    #[serde(rename = "directory")]
    pub is_directory: bool,
    #[serde(rename = "type")]
    pub type_label: String,
    pub size: u64,
    #[serde(rename = "size_text")]
    pub size_label: String,
}

impl Entry {
    pub fn new(name: String, url: String, is_directory: bool, size: u64) -> Entry {
        let (type_label, size_label) = if is_directory {
            (String::from("Folder"), String::from("-"))
        } else {
            (path::file_type(&name), format_size(size))
        };
        Entry {
            name,
            url,
            is_directory,
            type_label,
            size,
            size_label,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Listing {
    /// The folder as seen under the server's root
    pub folder: String,
    #[serde(skip)]
    pub parent_url: Option<String>,
    pub upload: bool,
    pub download: bool,
    pub deletion: bool,
    pub entries: Vec<Entry>,
}

impl Listing {
    /// Folders first, then files, each alphabetically.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()))
        });
    }

    pub fn html(&self) -> String {
        let mut out = String::with_capacity(1024 + self.entries.len() * 256);
        out.push_str(
            "<!DOCTYPE html><html><head><meta charset=\"UTF-8\">\
             <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
             <title>SD Card Content</title></head><body>",
        );
        out.push_str("<h1>SD Card Content</h1>");
        out.push_str(&format!("<h2>Folder {}</h2>", html_escape(&self.folder)));

        if self.upload {
            out.push_str(
                "<p><input type=\"file\" id=\"upload\"> \
                 <button onclick=\"upload()\">Upload</button></p>",
            );
        }

        out.push_str("<table><tr><th>Name</th><th>Type</th><th>Size</th>");
        if self.download || self.deletion {
            out.push_str("<th>Actions</th>");
        }
        out.push_str("</tr>");

        if let Some(parent) = &self.parent_url {
            out.push_str(&format!(
                "<tr><td><a href=\"{}\">..</a></td><td>Folder</td><td>-</td></tr>",
                html_escape(parent)
            ));
        }

        for entry in &self.entries {
            self.html_row(&mut out, entry);
        }
        out.push_str("</table>");

        if self.upload || self.deletion {
            out.push_str("<script>");
            if self.upload {
                out.push_str(
                    "function upload(){var f=document.getElementById('upload').files[0];if(!f)return;\
                     fetch(location.pathname+'?name='+encodeURIComponent(f.name),{method:'POST',body:f})\
                     .then(function(){location.reload();});}",
                );
            }
            if self.deletion {
                out.push_str(
                    "function remove(url){fetch(url,{method:'DELETE'})\
                     .then(function(){location.reload();});}",
                );
            }
            out.push_str("</script>");
        }
        out.push_str("</body></html>");
        out
    }

    fn html_row(&self, out: &mut String, entry: &Entry) {
        let name = html_escape(&entry.name);
        let url = html_escape(&entry.url);
        out.push_str("<tr><td>");
        if entry.is_directory || self.download {
            out.push_str(&format!("<a href=\"{}\">{}</a>", url, name));
        } else {
            out.push_str(&name);
        }
        out.push_str(&format!(
            "</td><td>{}</td><td>{}</td>",
            html_escape(&entry.type_label),
            entry.size_label
        ));
        if self.download || self.deletion {
            out.push_str("<td>");
            if self.download && !entry.is_directory {
                out.push_str(&format!("<a href=\"{}\" download>Download</a> ", url));
            }
            if self.deletion {
                out.push_str(&format!("<button onclick=\"remove('{}')\">Delete</button>", url));
            }
            out.push_str("</td>");
        }
        out.push_str("</tr>");
    }

    /// The listing for scripts. `None` if it grew beyond [`MAX_JSON`].
    pub fn json(&self) -> Option<String> {
        let mut buffer = vec![0u8; 1024];
        loop {
            match serde_json_core::to_slice(self, &mut buffer) {
                Ok(len) => {
                    buffer.truncate(len);
                    return String::from_utf8(buffer).ok();
                }
                Err(serde_json_core::ser::Error::BufferFull) if buffer.len() < MAX_JSON => {
                    let len = (buffer.len() * 2).min(MAX_JSON);
                    buffer.resize(len, 0);
                }
                Err(_) => return None,
            }
        }
    }
}

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
