//! Building [`CollectorDocument`]s from collected bytes.
//!
//! Message parsing is deliberately shallow: headers are unfolded and the
//! subject and date read out, image parts are listed by their declared type
//! and name, and the remainder is kept as text.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::{
  domain::document::{CollectorDocument, ImageAttachment, SourceType},
  index::ScannedMessage,
  mail::MessageId,
};

const RFC822: &str = "message/rfc822";

/// The RFC 822 payload of an `.emlx` file.
///
/// The format is a decimal byte count on the first line, the message, then a
/// property list. Anything that does not look like that is returned whole.
pub fn emlx_payload(bytes: &[u8]) -> &[u8] {
  let Some(newline) = bytes.iter().position(|&b| b == b'\n') else {
    return bytes;
  };
  let Some(length) = std::str::from_utf8(&bytes[..newline])
    .ok()
    .and_then(|s| s.trim().parse::<usize>().ok())
  else {
    return bytes;
  };
  let start = newline + 1;
  let end = start.saturating_add(length).min(bytes.len());
  &bytes[start..end]
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedMessage {
  pub subject: Option<String>,
  pub date: Option<DateTime<Utc>>,
  pub body: String,
  pub images: Vec<ImageAttachment>,
}

/// Split headers from body and pick out what documents need
pub fn parse_message(raw: &[u8]) -> ParsedMessage {
  let text = String::from_utf8_lossy(raw);
  let (head, body) = split_head(&text);

  let mut headers: Vec<(String, String)> = Vec::new();
  for line in head.lines() {
    if line.starts_with([' ', '\t']) {
      if let Some((_, value)) = headers.last_mut() {
        value.push(' ');
        value.push_str(line.trim());
      }
      continue;
    }
    if let Some((name, value)) = line.split_once(':') {
      headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
  }
  let header = |name: &str| {
    headers
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, v)| v.clone())
      .filter(|v| !v.is_empty())
  };

  ParsedMessage {
    subject: header("subject"),
    date: header("date")
      .and_then(|d| DateTime::parse_from_rfc2822(&d).ok())
      .map(|d| d.with_timezone(&Utc)),
    images: image_parts(body),
    body: body.to_string(),
  }
}

fn split_head(text: &str) -> (&str, &str) {
  for separator in ["\r\n\r\n", "\n\n"] {
    if let Some(index) = text.find(separator) {
      return (&text[..index], &text[index + separator.len()..]);
    }
  }
  (text, "")
}

/// Image MIME parts, by declared content type and name
fn image_parts(body: &str) -> Vec<ImageAttachment> {
  let lines: Vec<&str> = body.lines().collect();
  let mut images = Vec::new();

  for (i, line) in lines.iter().enumerate() {
    let Some(value) = strip_prefix_ignore_case(line, "content-type:") else {
      continue;
    };
    let mime = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    if !mime.starts_with("image/") {
      continue;
    }

    // Parameters may continue on the following folded lines
    let block: Vec<&str> = lines[i..(i + 4).min(lines.len())].to_vec();
    let filename = block
      .iter()
      .find_map(|l| quoted_param(l, "name"))
      .unwrap_or_else(|| format!("image-{}", images.len() + 1));
    let content_id = block.iter().find_map(|l| {
      strip_prefix_ignore_case(l, "content-id:").map(|v| v.trim().trim_matches(['<', '>']).to_string())
    });

    images.push(ImageAttachment {
      filename,
      mime_type: mime,
      size: 0,
      content_id,
      path: None,
    });
  }
  images
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
  let head = line.get(..prefix.len())?;
  head.eq_ignore_ascii_case(prefix).then(|| &line[prefix.len()..])
}

/// Value of `name="..."` (or `filename="..."`) in a header line
fn quoted_param(line: &str, param: &str) -> Option<String> {
  let lower = line.to_ascii_lowercase();
  let start = lower.find(&format!("{param}=\""))? + param.len() + 2;
  let end = line[start..].find('"')? + start;
  Some(line[start..end].to_string()).filter(|s| !s.is_empty())
}

// ============================================================================
// Documents
// ============================================================================

pub fn index_document_id(row_id: i64) -> String {
  format!("mail-index:{row_id}")
}

pub fn remote_document_id(account: &str, folder: &str, id: MessageId) -> String {
  format!("imap:{account}:{folder}:{id}")
}

/// Document for a message found through the local mail index
pub fn document_from_index(message: &ScannedMessage, file_bytes: &[u8]) -> CollectorDocument {
  let raw = emlx_payload(file_bytes);
  let parsed = parse_message(raw);
  let record = &message.record;

  let mut document = CollectorDocument::new(SourceType::LocalMail, index_document_id(record.row_id), parsed.body, raw)
    .with_title(record.subject.clone().or(parsed.subject))
    .with_mime_type(RFC822, "email")
    .with_timestamps(record.sent_at.or(parsed.date), None)
    .with_images(parsed.images);
  if let Some(uri) = message
    .file
    .as_ref()
    .and_then(|f| url::Url::from_file_path(&f.path).ok())
  {
    document = document.with_canonical_uri(uri.to_string());
  }
  document
}

/// Document for a message fetched from a remote mailbox
pub fn document_from_remote(account: &str, folder: &str, id: MessageId, raw: &[u8]) -> CollectorDocument {
  let parsed = parse_message(raw);
  CollectorDocument::new(
    SourceType::RemoteMail,
    remote_document_id(account, folder, id),
    parsed.body,
    raw,
  )
  .with_title(parsed.subject)
  .with_mime_type(RFC822, "email")
  .with_timestamps(parsed.date, None)
  .with_images(parsed.images)
}

fn mime_for_extension(extension: &str) -> (&'static str, &'static str) {
  match extension {
    "txt" | "log" => ("text/plain", "text"),
    "md" | "markdown" => ("text/markdown", "text"),
    "html" | "htm" => ("text/html", "text"),
    "json" => ("application/json", "text"),
    "csv" => ("text/csv", "text"),
    "pdf" => ("application/pdf", "pdf"),
    "eml" => (RFC822, "email"),
    "png" => ("image/png", "image"),
    "jpg" | "jpeg" => ("image/jpeg", "image"),
    "gif" => ("image/gif", "image"),
    "heic" => ("image/heic", "image"),
    "webp" => ("image/webp", "image"),
    _ => ("application/octet-stream", "binary"),
  }
}

/// Document for a file picked up by a directory watch.
///
/// Image files become a document with the file as its single attachment.
pub fn document_from_file(path: &Path, bytes: &[u8], modified: Option<DateTime<Utc>>) -> CollectorDocument {
  let extension = path
    .extension()
    .map(|e| e.to_string_lossy().to_lowercase())
    .unwrap_or_default();
  let (mime, content_type) = mime_for_extension(&extension);
  let filename = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();

  let is_image = content_type == "image";
  let content = if is_image {
    String::new()
  } else {
    String::from_utf8_lossy(bytes).into_owned()
  };

  let mut document = CollectorDocument::new(SourceType::File, path.to_string_lossy(), content, bytes)
    .with_title(Some(filename.clone()))
    .with_mime_type(mime, content_type)
    .with_timestamps(modified, modified);
  if let Ok(uri) = url::Url::from_file_path(path) {
    document = document.with_canonical_uri(uri.to_string());
  }
  if is_image {
    document = document.with_images(vec![ImageAttachment {
      filename,
      mime_type: mime.to_string(),
      size: bytes.len() as u64,
      content_id: None,
      path: Some(path.to_path_buf()),
    }]);
  }
  document
}
